#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pk500::app::config::{CrawlConfig, DataFormat, FetchConfig, OutputConfig, RunConfig, SummaryMode};
use pk500::app::error::TransportError;
use pk500::app::fetch::{ClientIdentity, Fetcher, RawResponse, Transport};
use tokio_util::sync::CancellationToken;

pub const BASE: &str = "https://www.psacard.com";
pub const ROOT_PATH: &str = "/pop/tcg-cards/156940";

/// Canned site keyed by absolute URL; anything unknown is a 404.
#[derive(Default)]
pub struct FakeSite {
    pages: Mutex<HashMap<String, RawResponse>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSite {
    pub fn page(&self, path: &str, body: impl Into<String>) -> &Self {
        self.respond(path, RawResponse::ok(body))
    }

    pub fn respond(&self, path: &str, response: RawResponse) -> &Self {
        self.pages.lock().unwrap().insert(url(path), response);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, path: &str) -> usize {
        let target = url(path);
        self.calls().iter().filter(|u| **u == target).count()
    }
}

#[async_trait]
impl Transport for FakeSite {
    async fn get(&self, url: &str, _identity: ClientIdentity) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| RawResponse::status(404)))
    }

    fn supports_hardened(&self) -> bool {
        false
    }
}

pub fn url(path: &str) -> String {
    format!("{BASE}{path}")
}

pub fn html(title: &str, body: &str) -> String {
    format!("<html><head><title>{title}</title></head><body>{body}</body></html>")
}

pub fn link(href: &str, text: &str) -> String {
    format!(r#"<a href="{href}">{text}</a>"#)
}

/// A card page with a price-by-grade table; `rows` are (grade, average, population).
pub fn card_page(name: &str, rows: &[(&str, &str, &str)]) -> String {
    let mut table = String::from(
        "<table><thead><tr><th>Grade</th><th>Population</th><th>Average Price</th></tr></thead><tbody>",
    );
    for (grade, avg, pop) in rows {
        table.push_str(&format!("<tr><td>{grade}</td><td>{pop}</td><td>{avg}</td></tr>"));
    }
    table.push_str("</tbody></table>");
    html(&format!("{name} Auction Prices | PSA"), &format!("<h1>{name}</h1>{table}"))
}

pub const CHARIZARD: &str = "/auctionprices/tcg-cards/pokemon-game/charizard-holo/1001";
pub const BLASTOISE: &str = "/auctionprices/tcg-cards/pokemon-game/blastoise-holo/1002";
pub const VENUSAUR: &str = "/auctionprices/tcg-cards/pokemon-game/venusaur-holo/1003";
pub const PIKACHU: &str = "/auctionprices/tcg-cards/pokemon-game/pikachu/1004";
pub const SCYTHER: &str = "/auctionprices/tcg-cards/pokemon-jungle/scyther-holo/2001";
pub const AERODACTYL: &str = "/auctionprices/tcg-cards/pokemon-fossil/aerodactyl-holo/3001";
pub const DITTO: &str = "/auctionprices/tcg-cards/pokemon-fossil/ditto-holo/3002";
pub const BLACK_LOTUS: &str = "/auctionprices/tcg-cards/magic-unlimited/black-lotus/9001";

pub const BASE_SET: &str = "/auctionprices/tcg-cards/pokemon-game/57801";
pub const JUNGLE: &str = "/auctionprices/tcg-cards/pokemon-jungle/57802";
pub const FOSSIL: &str = "/auctionprices/tcg-cards/pokemon-fossil/58001";
pub const MAGIC: &str = "/auctionprices/tcg-cards/magic-unlimited/57900";

/// Two years, three Pokémon sets and one Magic set.
///
/// Valued cards in discovery order: Charizard 5000 (100 × 50), Blastoise 10,
/// Venusaur 20, Pikachu 40 (20 × 2), Scyther 30. Aerodactyl has no price table
/// and Ditto no top-grade row. Charizard is listed again under Jungle.
pub fn pokemon_site() -> Arc<FakeSite> {
    let site = FakeSite::default();
    site.page(
        ROOT_PATH,
        html(
            "Population Report",
            &[
                link("/pop/tcg-cards/2000/58000", "2000"),
                link("/pop/tcg-cards/1999/57000", "1999"),
                link("/pop/tcg-cards/1999/57000#top", "1999 again"),
                link("/pop/tcg-cards/1999/57000/extra", "not a year"),
                link("https://elsewhere.example/pop/tcg-cards/2001/59000", "offsite"),
            ]
            .concat(),
        ),
    )
    .page(
        "/pop/tcg-cards/1999/57000",
        html(
            "1999",
            &[
                link("/pop/tcg-cards/1999/pokemon-game/57801", "Pokemon Game"),
                link("/pop/tcg-cards/1999/magic-unlimited/57900", "Magic Unlimited"),
                link("/pop/tcg-cards/1999/pokemon-jungle/57802", "Pokémon Jungle"),
                link("/pop/tcg-cards/1999/pokemon-game/57801", "Pokemon Game"),
            ]
            .concat(),
        ),
    )
    .page(
        "/pop/tcg-cards/2000/58000",
        html(
            "2000",
            &link("/pop/tcg-cards/2000/pokemon-fossil/58001", "POKEMON FOSSIL"),
        ),
    )
    .page(
        BASE_SET,
        html(
            "Base Set",
            &[
                link(CHARIZARD, "Charizard"),
                link(&format!("{BLASTOISE}?sort=grade"), "Blastoise"),
                link(CHARIZARD, "Charizard (again)"),
                link("?page=2", "Next"),
            ]
            .concat(),
        ),
    )
    .page(
        &format!("{BASE_SET}?page=2"),
        html(
            "Base Set page 2",
            &[
                link(VENUSAUR, "Venusaur"),
                link(PIKACHU, "Pikachu"),
                link("?page=2", "Next"),
            ]
            .concat(),
        ),
    )
    .page(
        JUNGLE,
        html(
            "Jungle",
            &[link(SCYTHER, "Scyther"), link(CHARIZARD, "Charizard")].concat(),
        ),
    )
    .page(
        FOSSIL,
        html(
            "Fossil",
            &[link(AERODACTYL, "Aerodactyl"), link(DITTO, "Ditto")].concat(),
        ),
    )
    .page(MAGIC, html("Magic", &link(BLACK_LOTUS, "Black Lotus")))
    .page(
        CHARIZARD,
        card_page("Charizard Holo", &[("GEM-MT 10", "$100.00", "50"), ("MINT 9", "$40.00", "900")]),
    )
    .page(BLASTOISE, card_page("Blastoise Holo", &[("GEM-MT 10", "$10.00", "1")]))
    .page(VENUSAUR, card_page("Venusaur Holo", &[("GEM-MT 10", "$10.00", "2")]))
    .page(PIKACHU, card_page("Pikachu", &[("GEM-MT 10", "$20.00", "2")]))
    .page(SCYTHER, card_page("Scyther Holo", &[("Gem Mint 10", "$15.00", "2")]))
    .page(AERODACTYL, html("Aerodactyl | PSA", "<h1>Aerodactyl Holo</h1><p>No sales yet</p>"))
    .page(DITTO, card_page("Ditto Holo", &[("MINT 9", "$80.00", "4")]))
    .page(BLACK_LOTUS, card_page("Black Lotus", &[("GEM-MT 10", "$90,000.00", "3")]));
    Arc::new(site)
}

pub fn run_config(dir: &Path) -> RunConfig {
    RunConfig {
        fetch: FetchConfig::immediate(),
        crawl: CrawlConfig {
            base_url: BASE.to_string(),
            root_path: ROOT_PATH.to_string(),
            ..CrawlConfig::default()
        },
        output: OutputConfig {
            history_path: dir.join("data").join("index_history.csv"),
            out_dir: dir.join("out"),
            format: DataFormat::Csv,
            summary: SummaryMode::PopWeighted,
            top_n: 10,
        },
        workers: 1,
    }
}

pub fn fetcher(site: &Arc<FakeSite>, config: &RunConfig) -> Fetcher<FakeSite> {
    Fetcher::new(config.fetch.clone(), Arc::clone(site), CancellationToken::new())
}
