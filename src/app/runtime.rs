use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{Cli, RunConfig, SummaryMode};
use super::crawl::CardUrls;
use super::data_io::{
    OutputPaths, POP_WEIGHTED_HISTORY_HEADERS, append_history, load_base_divisor, render_summary,
    render_top, verify_history, write_ranking, write_run_info,
};
use super::error::{FetchError, Result, RunError};
use super::extract::extract_page;
use super::fetch::{Fetcher, ReqwestTransport, Transport};
use super::index::{Aggregate, TopN, aggregate};
use super::logging::init_logging;
use super::types::{CardValue, RunTimes};

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub aggregate: Aggregate,
    pub top: Vec<CardValue>,
    /// Card URLs the crawl yielded, valued or not.
    pub cards_seen: usize,
    /// Pages skipped in keep-going mode.
    pub failures: Vec<FetchError>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_level.as_deref()) {
        eprintln!("logging setup failed: {e}");
    }
    let config = RunConfig::try_from(&cli)?;
    let run = RunTimes::now();

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });

    let transport = Arc::new(ReqwestTransport::new(&config.fetch)?);
    let fetcher = Fetcher::new(config.fetch.clone(), transport, cancel);
    let result = run_pipeline(fetcher, &config, run).await;
    interrupt.abort();
    let report = result?;

    println!("{}", render_top(&report.top));
    print!("{}", render_summary(&report.aggregate.snapshot));
    if !report.failures.is_empty() {
        println!("Skipped pages: {} (see run_info.txt)", report.failures.len());
    }
    Ok(())
}

/// Crawls, values, aggregates and persists one run.
///
/// A cancelled or failed run returns before anything is written.
pub async fn run_pipeline<T>(fetcher: Fetcher<T>, config: &RunConfig, run: RunTimes) -> Result<RunReport>
where
    T: Transport + ?Sized + 'static,
{
    let output = &config.output;
    // History problems surface before the crawl, not after an hour of it.
    let base_divisor = match output.summary {
        SummaryMode::PopWeighted => {
            verify_history(&output.history_path, &POP_WEIGHTED_HISTORY_HEADERS)?;
            None
        }
        SummaryMode::IndexLevel => load_base_divisor(&output.history_path)?,
    };

    let urls = CardUrls::new(fetcher.clone(), config.crawl.clone());
    let collected = Collector::new(output.top_n, config.crawl.keep_going)
        .run(&fetcher, urls, config.workers)
        .await?;

    let Collected {
        values,
        top,
        cards_seen,
        failures,
    } = collected;
    let aggregate = aggregate(values, output.summary, base_divisor, run);
    let snapshot = &aggregate.snapshot;
    info!(
        cards_seen,
        valued = snapshot.total_cards,
        basket = snapshot.basket_size,
        skipped = failures.len(),
        "run aggregated"
    );

    let paths = OutputPaths::new(&output.out_dir, output.format, output.top_n);
    let top = top.into_ranked();
    write_ranking(&paths.top, output.format, &top)?;
    if snapshot.basket_size > 0 {
        write_ranking(&paths.basket, output.format, aggregate.basket())?;
    }
    append_history(&output.history_path, snapshot)?;
    let failure_lines = failures.iter().map(ToString::to_string).collect::<Vec<_>>();
    write_run_info(&paths.run_info, snapshot, &failure_lines)?;
    debug!(history = %output.history_path.display(), "history appended");

    Ok(RunReport {
        aggregate,
        top,
        cards_seen,
        failures,
    })
}

/// `None` when the page carries no usable top-grade data.
type CardOutcome = std::result::Result<Option<CardValue>, FetchError>;

/// Fetches one card page and values it. The parsed document never crosses an await.
async fn value_card<T: Transport + ?Sized>(fetcher: &Fetcher<T>, url: &str) -> CardOutcome {
    let page = fetcher.fetch(url).await?;
    Ok(extract_page(&page))
}

struct Collected {
    /// Valued cards in discovery order.
    values: Vec<CardValue>,
    top: TopN,
    cards_seen: usize,
    failures: Vec<FetchError>,
}

/// Gathers card values from up to `workers` concurrent fetches.
///
/// Results land in per-URL slots so the final order is discovery order no
/// matter which worker finishes first.
struct Collector {
    slots: Vec<Option<CardValue>>,
    top: TopN,
    keep_going: bool,
    failures: Vec<FetchError>,
}

impl Collector {
    fn new(top_n: usize, keep_going: bool) -> Self {
        Self {
            slots: Vec::new(),
            top: TopN::new(top_n),
            keep_going,
            failures: Vec::new(),
        }
    }

    async fn run<T>(mut self, fetcher: &Fetcher<T>, mut urls: CardUrls<T>, workers: usize) -> Result<Collected>
    where
        T: Transport + ?Sized + 'static,
    {
        let mut tasks: JoinSet<(usize, String, CardOutcome)> = JoinSet::new();

        let drained = async {
            while let Some(url) = urls.next().await? {
                let seq = self.slots.len();
                self.slots.push(None);

                if workers <= 1 {
                    let result = value_card(fetcher, &url).await;
                    self.record(seq, &url, result)?;
                    continue;
                }

                while tasks.len() >= workers {
                    if let Some(joined) = tasks.join_next().await {
                        let (seq, url, result) = joined?;
                        self.record(seq, &url, result)?;
                    }
                }
                let worker = fetcher.clone();
                tasks.spawn(async move {
                    let result = value_card(&worker, &url).await;
                    (seq, url, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (seq, url, result) = joined?;
                self.record(seq, &url, result)?;
            }
            Ok::<(), RunError>(())
        }
        .await;

        if let Err(err) = drained {
            tasks.abort_all();
            return Err(err);
        }

        let mut failures = urls.failures().to_vec();
        failures.append(&mut self.failures);
        let cards_seen = self.slots.len();
        Ok(Collected {
            values: self.slots.into_iter().flatten().collect(),
            top: self.top,
            cards_seen,
            failures,
        })
    }

    fn record(&mut self, seq: usize, url: &str, result: CardOutcome) -> Result<()> {
        match result {
            Ok(Some(card)) => {
                debug!(url = %card.url, value_usd = card.value_usd, "card valued");
                self.top.offer(seq, &card);
                self.slots[seq] = Some(card);
            }
            Ok(None) => debug!(url, "card skipped"),
            Err(err) if self.keep_going && !err.is_cancelled() => {
                warn!(error = %err, "skipping card");
                self.failures.push(err);
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}
