//! Card URL discovery.
//!
//! The site is walked in a fixed shape: a population root lists year pages,
//! each year page lists sets, and each set has a paginated auction-prices
//! listing of cards. [`CardUrls`] yields the cards lazily, fetching one page at
//! a time, and never yields the same card twice.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;
use url::Url;

use super::config::CrawlConfig;
use super::error::FetchError;
use super::extract::normalize_text;
use super::fetch::{FetchedPage, Fetcher, Transport};
use super::types::SetReference;

pub const AUCTION_PREFIX: &str = "/auctionprices/tcg-cards";

const NEXT_LABELS: [&str; 4] = ["next", "next >", ">", "→"];

static YEAR_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/pop/tcg-cards/\d{4}/\d+$").expect("hardcoded regex pattern is valid")
});
static SET_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/pop/tcg-cards/(\d{4})/([^/]+)/(\d+)$").expect("hardcoded regex pattern is valid")
});
static CARD_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/auctionprices/tcg-cards/[^/]+/.+/\d+$").expect("hardcoded regex pattern is valid")
});

pub fn is_year_path(path: &str) -> bool {
    YEAR_PATH.is_match(path)
}

pub fn parse_set_path(path: &str) -> Option<SetReference> {
    let caps = SET_PATH.captures(path)?;
    Some(SetReference {
        year: caps[1].parse().ok()?,
        slug: caps[2].to_string(),
        id: caps[3].to_string(),
    })
}

/// Card pages sit below a set listing and end in a numeric item id.
pub fn is_card_path(path: &str) -> bool {
    CARD_PATH.is_match(path)
}

pub fn is_next_label(text: &str) -> bool {
    let label = normalize_text(text).to_lowercase();
    NEXT_LABELS.contains(&label.as_str())
}

/// Accent-stripped, case-folded form used for category matching.
pub fn normalize_for_match(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// `"Pokémon Base Set"` and `"POKEMON JUNGLE"` both match `"pokemon"`.
pub fn matches_category(link_text: &str, term: &str) -> bool {
    let text = link_text.trim();
    !text.is_empty() && normalize_for_match(text).contains(&normalize_for_match(term.trim()))
}

struct Link {
    url: Url,
    text: String,
}

impl Link {
    fn path(&self) -> &str {
        self.url.path()
    }

    /// Path plus query, the form hrefs are matched in.
    fn site_path(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }
}

fn resolve_href(page_url: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("mailto:")
        || href.starts_with("javascript:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let mut url = page_url.join(href).ok()?;
    if url.host_str() != page_url.host_str() {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

fn same_site_links(doc: &Html, page_url: &str) -> Vec<Link> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    doc.select(&selector)
        .filter_map(|el| {
            let url = resolve_href(&base, el.value().attr("href")?)?;
            let text = normalize_text(&el.text().collect::<Vec<_>>().join(" "));
            Some(Link { url, text })
        })
        .collect()
}

/// Year pages linked from the root, deduplicated and sorted.
pub fn year_page_urls(doc: &Html, page_url: &str) -> Vec<String> {
    same_site_links(doc, page_url)
        .into_iter()
        .filter(|link| is_year_path(&link.site_path()))
        .map(|link| link.url.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sets linked from a year page, in page order, optionally restricted to a category.
pub fn set_references(doc: &Html, page_url: &str, category: Option<&str>) -> Vec<SetReference> {
    same_site_links(doc, page_url)
        .into_iter()
        .filter(|link| category.is_none_or(|term| matches_category(&link.text, term)))
        .filter_map(|link| parse_set_path(&link.site_path()))
        .collect()
}

/// Card URLs on one listing page, in page order, without query or fragment.
pub fn card_urls_on_page(doc: &Html, page_url: &str) -> Vec<String> {
    same_site_links(doc, page_url)
        .into_iter()
        .filter(|link| is_card_path(link.path()))
        .map(|mut link| {
            link.url.set_query(None);
            link.url.to_string()
        })
        .collect()
}

/// The listing's "next page" link, if it stays inside the auction-prices namespace.
pub fn next_page_url(doc: &Html, page_url: &str) -> Option<String> {
    same_site_links(doc, page_url)
        .into_iter()
        .find(|link| is_next_label(&link.text) && link.path().starts_with(AUCTION_PREFIX))
        .map(|link| link.url.to_string())
}

fn scan_root(page: &FetchedPage) -> Vec<String> {
    year_page_urls(&page.document(), &page.url)
}

fn scan_year(page: &FetchedPage, category: Option<&str>) -> Vec<SetReference> {
    set_references(&page.document(), &page.url, category)
}

fn scan_listing(page: &FetchedPage) -> (Vec<String>, Option<String>) {
    let doc = page.document();
    (card_urls_on_page(&doc, &page.url), next_page_url(&doc, &page.url))
}

/// Auction-prices set listings, discovered year by year.
pub struct SetUrls<T: ?Sized> {
    fetcher: Fetcher<T>,
    config: CrawlConfig,
    years: Option<VecDeque<String>>,
    buffered: VecDeque<String>,
    seen: HashSet<String>,
    yielded: usize,
    failures: Vec<FetchError>,
}

impl<T: Transport + ?Sized> SetUrls<T> {
    pub fn new(fetcher: Fetcher<T>, config: CrawlConfig) -> Self {
        Self {
            fetcher,
            config,
            years: None,
            buffered: VecDeque::new(),
            seen: HashSet::new(),
            yielded: 0,
            failures: Vec::new(),
        }
    }

    pub fn failures(&self) -> &[FetchError] {
        &self.failures
    }

    pub async fn next(&mut self) -> Result<Option<String>, FetchError> {
        loop {
            if self.config.max_sets.is_some_and(|max| self.yielded >= max) {
                return Ok(None);
            }
            if let Some(set_url) = self.buffered.pop_front() {
                self.yielded += 1;
                return Ok(Some(set_url));
            }

            let Some(years) = self.years.as_mut() else {
                let page = self.fetcher.fetch(&self.config.root_url()).await?;
                let years = scan_root(&page);
                info!(count = years.len(), "year pages found");
                self.years = Some(years.into());
                continue;
            };
            let Some(year_url) = years.pop_front() else {
                return Ok(None);
            };

            match self.fetcher.fetch(&year_url).await {
                Ok(page) => {
                    let sets = scan_year(&page, self.config.category.as_deref());
                    debug!(url = %year_url, sets = sets.len(), "year page scanned");
                    for set in sets {
                        let set_url = set.auction_prices_url(&self.config.base_url);
                        if self.seen.insert(set_url.clone()) {
                            self.buffered.push_back(set_url);
                        }
                    }
                }
                Err(err) => self.absorb(err)?,
            }
        }
    }

    /// In keep-going mode a failed page is recorded and skipped.
    fn absorb(&mut self, err: FetchError) -> Result<(), FetchError> {
        if self.config.keep_going && !err.is_cancelled() {
            warn!(error = %err, "skipping page");
            self.failures.push(err);
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Walks one set's paginated listing.
struct SetPager {
    next_url: Option<String>,
    visited: HashSet<String>,
    seen: HashSet<String>,
}

impl SetPager {
    fn new(set_url: String) -> Self {
        Self {
            next_url: Some(set_url),
            visited: HashSet::new(),
            seen: HashSet::new(),
        }
    }

    /// New card URLs from the next page, or `None` once the listing is done.
    async fn next_page<T: Transport + ?Sized>(
        &mut self,
        fetcher: &Fetcher<T>,
    ) -> Result<Option<Vec<String>>, FetchError> {
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };
        if !self.visited.insert(url.clone()) {
            return Ok(None);
        }

        let page = fetcher.fetch(&url).await?;
        let (cards, next) = scan_listing(&page);
        let fresh = cards
            .into_iter()
            .filter(|card| self.seen.insert(card.clone()))
            .collect::<Vec<_>>();
        debug!(url = %url, new_cards = fresh.len(), has_next = next.is_some(), "listing page scanned");
        if !fresh.is_empty() {
            self.next_url = next;
        }
        Ok(Some(fresh))
    }
}

/// Lazy, finite, non-restartable sequence of unique card URLs in first-seen order.
pub struct CardUrls<T: ?Sized> {
    fetcher: Fetcher<T>,
    sets: SetUrls<T>,
    pager: Option<SetPager>,
    pending: VecDeque<String>,
    seen: HashSet<String>,
    max_cards: Option<usize>,
    yielded: usize,
    sets_visited: usize,
    done: bool,
}

impl<T: Transport + ?Sized> CardUrls<T> {
    pub fn new(fetcher: Fetcher<T>, config: CrawlConfig) -> Self {
        let max_cards = config.max_cards;
        Self {
            sets: SetUrls::new(fetcher.clone(), config),
            fetcher,
            pager: None,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            max_cards,
            yielded: 0,
            sets_visited: 0,
            done: max_cards == Some(0),
        }
    }

    pub fn failures(&self) -> &[FetchError] {
        self.sets.failures()
    }

    pub fn sets_visited(&self) -> usize {
        self.sets_visited
    }

    pub async fn next(&mut self) -> Result<Option<String>, FetchError> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(card_url) = self.pending.pop_front() {
                if !self.seen.insert(card_url.clone()) {
                    continue;
                }
                self.yielded += 1;
                if self.max_cards.is_some_and(|max| self.yielded >= max) {
                    self.done = true;
                }
                return Ok(Some(card_url));
            }

            if let Some(pager) = self.pager.as_mut() {
                match pager.next_page(&self.fetcher).await {
                    Ok(Some(cards)) => self.pending.extend(cards),
                    Ok(None) => self.pager = None,
                    Err(err) => {
                        self.pager = None;
                        self.sets.absorb(err)?;
                    }
                }
                continue;
            }

            match self.sets.next().await? {
                Some(set_url) => {
                    self.sets_visited += 1;
                    self.pager = Some(SetPager::new(set_url));
                }
                None => self.done = true,
            }
        }
    }

    /// Drains the sequence.
    pub async fn collect_all(mut self) -> Result<(Vec<String>, Vec<FetchError>), FetchError> {
        let mut urls = Vec::new();
        while let Some(url) = self.next().await? {
            urls.push(url);
        }
        info!(sets = self.sets_visited, cards = urls.len(), "card URLs collected");
        Ok((urls, self.sets.failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://www.psacard.com/pop/tcg-cards/156940";

    fn doc(body: &str) -> Html {
        Html::parse_document(&format!("<html><body>{body}</body></html>"))
    }

    #[test]
    fn category_matching_strips_accents_and_case() {
        assert!(matches_category("Pokémon Base Set", "pokemon"));
        assert!(matches_category("POKEMON JUNGLE", "pokemon"));
        assert!(matches_category("  Pokemon Japanese Neo  ", "Pokémon"));
        assert!(!matches_category("Magic: The Gathering", "pokemon"));
        assert!(!matches_category("", "pokemon"));
    }

    #[test]
    fn url_shapes() {
        assert!(is_year_path("/pop/tcg-cards/1999/57000"));
        assert!(!is_year_path("/pop/tcg-cards/1999/base/57000"));
        assert!(!is_year_path("/pop/tcg-cards/1999/57000?x=1"));

        let set = parse_set_path("/pop/tcg-cards/1999/pokemon-game/57801").unwrap();
        assert_eq!(set.year, 1999);
        assert_eq!(set.slug, "pokemon-game");
        assert_eq!(set.id, "57801");
        assert!(parse_set_path("/pop/tcg-cards/1999/57801").is_none());

        assert!(is_card_path("/auctionprices/tcg-cards/pokemon-game/charizard-holo/544027"));
        assert!(!is_card_path("/auctionprices/tcg-cards/pokemon-game/57801"));
        assert!(!is_card_path("/auctionprices/tcg-cards/pokemon-game/charizard-holo"));
    }

    #[test]
    fn next_labels() {
        for label in ["Next", " next ", "Next >", ">", "→"] {
            assert!(is_next_label(label), "{label}");
        }
        for label in ["Previous", "<", "next page", "2"] {
            assert!(!is_next_label(label), "{label}");
        }
    }

    #[test]
    fn year_links_are_sorted_and_deduplicated() {
        let doc = doc(r#"
            <a href="/pop/tcg-cards/2001/300">2001</a>
            <a href="/pop/tcg-cards/1999/100">1999</a>
            <a href="https://www.psacard.com/pop/tcg-cards/2001/300">2001 again</a>
            <a href="https://elsewhere.com/pop/tcg-cards/2002/400">offsite</a>
            <a href="/pop/tcg-cards/1999/base/100">not a year</a>
        "#);
        assert_eq!(
            year_page_urls(&doc, PAGE),
            vec![
                "https://www.psacard.com/pop/tcg-cards/1999/100".to_string(),
                "https://www.psacard.com/pop/tcg-cards/2001/300".to_string(),
            ]
        );
    }

    #[test]
    fn set_links_are_filtered_by_link_text() {
        let doc = doc(r#"
            <a href="/pop/tcg-cards/1999/pokemon-game/1">Pokémon Game</a>
            <a href="/pop/tcg-cards/1999/magic/2">Magic: The Gathering</a>
            <a href="/pop/tcg-cards/1999/jungle/3">POKEMON JUNGLE</a>
        "#);
        let slugs = |category| {
            set_references(&doc, PAGE, category)
                .into_iter()
                .map(|s| s.slug)
                .collect::<Vec<_>>()
        };
        assert_eq!(slugs(Some("pokemon")), vec!["pokemon-game", "jungle"]);
        assert_eq!(slugs(None), vec!["pokemon-game", "magic", "jungle"]);
    }

    #[test]
    fn listing_scan_finds_cards_and_next_page() {
        let page = "https://www.psacard.com/auctionprices/tcg-cards/base/57801";
        let doc = doc(r##"
            <a href="/auctionprices/tcg-cards/base/57801">set itself</a>
            <a href="/auctionprices/tcg-cards/base/charizard/11#sales">Charizard</a>
            <a href="/auctionprices/tcg-cards/base/blastoise/12?tab=pop">Blastoise</a>
            <a href="/pop/tcg-cards/1999/base/57801">population</a>
            <a href="https://twitter.com/next">Next</a>
            <a href="/auctionprices/tcg-cards/base/57801?page=2"> Next &gt; </a>
        "##);
        assert_eq!(
            card_urls_on_page(&doc, page),
            vec![
                "https://www.psacard.com/auctionprices/tcg-cards/base/charizard/11".to_string(),
                "https://www.psacard.com/auctionprices/tcg-cards/base/blastoise/12".to_string(),
            ]
        );
        assert_eq!(
            next_page_url(&doc, page).as_deref(),
            Some("https://www.psacard.com/auctionprices/tcg-cards/base/57801?page=2")
        );
    }

    #[test]
    fn next_link_outside_namespace_is_ignored() {
        let doc = doc(r#"<a href="/pop/tcg-cards/1999/base/57801?page=2">next</a>"#);
        assert!(next_page_url(&doc, PAGE).is_none());
    }
}
