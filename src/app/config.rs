use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use super::error::{Result, RunError};

pub const DEFAULT_BASE_URL: &str = "https://www.psacard.com";
pub const DEFAULT_ROOT_PATH: &str = "/pop/tcg-cards/156940";
pub const DEFAULT_CATEGORY: &str = "pokemon";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const MAX_WORKERS: usize = 4;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "pk500",
    version,
    about = "Crawl top-grade auction prices and populations into a weighted card price index"
)]
pub struct Cli {
    #[arg(long, value_name = "URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, value_name = "PATH", default_value = DEFAULT_ROOT_PATH)]
    pub root_path: String,

    #[arg(long, value_name = "TEXT", default_value = DEFAULT_CATEGORY)]
    pub category: String,

    /// Keep every set regardless of its category.
    #[arg(long, default_value_t = false)]
    pub all_categories: bool,

    #[arg(long, value_name = "N")]
    pub max_sets: Option<usize>,

    #[arg(long, value_name = "N")]
    pub max_cards: Option<usize>,

    #[arg(long, value_name = "N", default_value_t = 7)]
    pub max_attempts: u32,

    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub read_timeout_secs: u64,

    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub base_delay_ms: u64,

    #[arg(long, value_name = "MS", default_value_t = 60_000)]
    pub max_delay_ms: u64,

    /// Pause after every successful request.
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    pub delay_ms: u64,

    /// Never retry a 403 with the hardened browser identity.
    #[arg(long, default_value_t = false)]
    pub no_hardened: bool,

    #[arg(long, value_name = "UA", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub workers: usize,

    /// Record failing pages and continue instead of aborting the run.
    #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
    pub keep_going: bool,

    #[arg(long, value_enum, default_value_t = SummaryMode::PopWeighted)]
    pub summary: SummaryMode,

    #[arg(long, value_name = "FILE", default_value = "data/index_history.csv")]
    pub history: PathBuf,

    #[arg(long, value_name = "DIR", default_value = ".")]
    pub out_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    pub format: FileFormatArg,

    #[arg(long, value_name = "N", default_value_t = 10)]
    pub top_n: usize,

    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

/// Which headline figure the run reports and persists.
#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum SummaryMode {
    /// Basket value divided by basket top-grade population.
    PopWeighted,
    /// Basket value over a divisor fixed by the first recorded run (base 10,000).
    IndexLevel,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

impl DataFormat {
    pub fn extension(self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Json => "json",
        }
    }
}

/// Retry, timeout and pacing policy for every page request of a run.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub inter_request_delay: Duration,
    pub user_agent: String,
    pub referer: String,
    pub hardened: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            inter_request_delay: Duration::from_secs(2),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: format!("{DEFAULT_BASE_URL}/"),
            hardened: true,
        }
    }
}

impl FetchConfig {
    /// No waiting anywhere; for fixtures and tests.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            inter_request_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub base_url: String,
    pub root_path: String,
    /// `None` disables category filtering.
    pub category: Option<String>,
    pub max_sets: Option<usize>,
    pub max_cards: Option<usize>,
    pub keep_going: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            root_path: DEFAULT_ROOT_PATH.to_string(),
            category: Some(DEFAULT_CATEGORY.to_string()),
            max_sets: None,
            max_cards: None,
            keep_going: false,
        }
    }
}

impl CrawlConfig {
    pub fn root_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.root_path)
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub history_path: PathBuf,
    pub out_dir: PathBuf,
    pub format: DataFormat,
    pub summary: SummaryMode,
    pub top_n: usize,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub fetch: FetchConfig,
    pub crawl: CrawlConfig,
    pub output: OutputConfig,
    pub workers: usize,
}

impl TryFrom<&Cli> for RunConfig {
    type Error = RunError;

    fn try_from(cli: &Cli) -> Result<Self> {
        let base_url = url::Url::parse(&cli.base_url)
            .map_err(|e| RunError::Config(format!("--base-url '{}': {e}", cli.base_url)))?;
        if !cli.root_path.starts_with('/') {
            return Err(RunError::Config(format!(
                "--root-path must start with '/': {}",
                cli.root_path
            )));
        }
        if cli.max_attempts == 0 {
            return Err(RunError::Config("--max-attempts must be at least 1".into()));
        }
        if cli.top_n == 0 {
            return Err(RunError::Config("--top-n must be at least 1".into()));
        }
        let base = base_url.as_str().trim_end_matches('/').to_string();

        let fetch = FetchConfig {
            max_attempts: cli.max_attempts,
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            read_timeout: Duration::from_secs(cli.read_timeout_secs),
            base_delay: Duration::from_millis(cli.base_delay_ms),
            max_delay: Duration::from_millis(cli.max_delay_ms),
            inter_request_delay: Duration::from_millis(cli.delay_ms),
            user_agent: cli.user_agent.clone(),
            referer: format!("{base}/"),
            hardened: !cli.no_hardened,
        };
        let category = if cli.all_categories {
            None
        } else {
            Some(cli.category.clone()).filter(|c| !c.trim().is_empty())
        };
        let crawl = CrawlConfig {
            base_url: base,
            root_path: cli.root_path.clone(),
            category,
            max_sets: cli.max_sets,
            max_cards: cli.max_cards,
            keep_going: cli.keep_going,
        };
        let output = OutputConfig {
            history_path: cli.history.clone(),
            out_dir: cli.out_dir.clone(),
            format: cli.format.into(),
            summary: cli.summary,
            top_n: cli.top_n,
        };

        Ok(Self {
            fetch,
            crawl,
            output,
            workers: sanitize_workers(cli.workers),
        })
    }
}

pub fn sanitize_workers(value: usize) -> usize {
    value.clamp(1, MAX_WORKERS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["pk500"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn defaults_match_reference_constants() {
        let config = RunConfig::try_from(&parse(&[])).unwrap();
        assert_eq!(config.fetch.max_attempts, 7);
        assert_eq!(config.fetch.base_delay, Duration::from_secs(1));
        assert_eq!(config.fetch.max_delay, Duration::from_secs(60));
        assert_eq!(config.fetch.inter_request_delay, Duration::from_secs(2));
        assert!(config.fetch.hardened);
        assert_eq!(config.crawl.category.as_deref(), Some("pokemon"));
        assert_eq!(
            config.crawl.root_url(),
            "https://www.psacard.com/pop/tcg-cards/156940"
        );
        assert_eq!(config.output.summary, SummaryMode::PopWeighted);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn all_categories_disables_filter() {
        let config = RunConfig::try_from(&parse(&["--all-categories"])).unwrap();
        assert!(config.crawl.category.is_none());
    }

    #[test]
    fn workers_are_clamped() {
        let config = RunConfig::try_from(&parse(&["--workers", "16"])).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(sanitize_workers(0), 1);
    }

    #[test]
    fn rejects_relative_root_path() {
        let err = RunConfig::try_from(&parse(&["--root-path", "pop/x"])).unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }
}
