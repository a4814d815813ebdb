//! Card-page extraction.
//!
//! Card pages carry an "auction prices by grade" table whose layout drifts
//! between pages: column order changes, headings go missing, the top grade is
//! labelled several ways and sometimes split over several rows. Every path
//! through here ends in either a value or `None`; nothing raises.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::fetch::FetchedPage;
use super::types::CardValue;

pub const PRICE_HEADER: &str = "Average Price";
pub const POPULATION_HEADER: &str = "Population";
pub const GRADE_HEADER: &str = "Grade";

static TITLE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\|\s*PSA.*$").expect("hardcoded regex pattern is valid"));
static TOP_GRADE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b10\b").expect("hardcoded regex pattern is valid"));

/// Extracts the card value from a fetched card page.
pub fn extract_page(page: &FetchedPage) -> Option<CardValue> {
    let doc = page.document();
    extract_card(&doc, &page.url)
}

pub fn extract_card(doc: &Html, source_url: &str) -> Option<CardValue> {
    let table = find_price_table(doc)?;

    let price_idx = column_index(&table.headers, PRICE_HEADER)?;
    let pop_idx = column_index(&table.headers, POPULATION_HEADER)?;
    let grade_idx = column_index(&table.headers, GRADE_HEADER).unwrap_or(0);
    let min_cells = price_idx.max(pop_idx) + 1;

    let mut value_usd = 0.0;
    let mut pop10 = 0u64;
    for row in &table.rows {
        if row.len() < min_cells {
            continue;
        }
        let grade = row.get(grade_idx).map(String::as_str).unwrap_or("");
        if !is_top_grade(grade) {
            continue;
        }
        let avg = parse_money(&row[price_idx]);
        let pop = parse_count(&row[pop_idx]);
        if avg > 0.0 && pop > 0 {
            value_usd += avg * pop as f64;
            pop10 += pop;
        }
    }

    let name = resolve_name(doc, source_url);
    let card = CardValue::from_totals(name, source_url, value_usd, pop10);
    if card.is_none() {
        debug!(url = source_url, "no top-grade price data");
    }
    card
}

/// Display name: first non-empty `h1`, else the cleaned `<title>`, else the URL.
pub fn resolve_name(doc: &Html, source_url: &str) -> String {
    let h1 = extract_first_text(doc, "h1");
    if !h1.is_empty() {
        return h1;
    }
    let title = strip_title_suffix(&extract_first_text(doc, "title"));
    if !title.is_empty() {
        return title;
    }
    source_url.to_string()
}

/// Drops the `| PSA ...` brand tail from a page title.
pub fn strip_title_suffix(title: &str) -> String {
    TITLE_SUFFIX.replace(title, "").trim().to_string()
}

/// Header text of a price-by-grade table mentions both price and population.
/// Case-sensitive, like the site's own labels.
pub fn is_price_table_header(header_text: &str) -> bool {
    header_text.contains(PRICE_HEADER) && header_text.contains(POPULATION_HEADER)
}

/// First column whose header contains `key`, ignoring case.
pub fn column_index(headers: &[String], key: &str) -> Option<usize> {
    let key = key.to_lowercase();
    headers.iter().position(|h| h.to_lowercase().contains(&key))
}

/// Accepts "GEM-MT 10", "Gem Mint 10", "10" and the like, but not "100" or "9".
pub fn is_top_grade(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty() && TOP_GRADE.is_match(text)
}

/// `"$5,777.50"` → `5777.5`; blanks, dashes and `N/A` → `0.0`.
pub fn parse_money(raw: &str) -> f64 {
    let s = raw.trim();
    if s.is_empty() || matches!(s, "-" | "—" | "N/A") {
        return 0.0;
    }
    let cleaned = s.replace(['$', ','], "");
    match cleaned.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            debug!(raw, "unparsable price, treating as 0");
            0.0
        }
    }
}

/// `"1,234"` → `1234`; anything non-numeric → `0`.
pub fn parse_count(raw: &str) -> u64 {
    let cleaned = raw.trim().replace(',', "");
    match cleaned.parse::<u64>() {
        Ok(v) => v,
        Err(_) => {
            if !cleaned.is_empty() {
                debug!(raw, "unparsable population, treating as 0");
            }
            0
        }
    }
}

struct PriceTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn find_price_table(doc: &Html) -> Option<PriceTable> {
    let table_sel = Selector::parse("table").ok()?;
    let th_sel = Selector::parse("th").ok()?;
    let tr_sel = Selector::parse("tr").ok()?;
    let cell_sel = Selector::parse("th, td").ok()?;

    for table in doc.select(&table_sel) {
        let header_text = table
            .select(&th_sel)
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" ");
        if !is_price_table_header(&header_text) {
            continue;
        }

        let mut rows = table.select(&tr_sel).map(|tr| {
            let has_th = tr.select(&th_sel).next().is_some();
            let cells = tr.select(&cell_sel).map(element_text).collect::<Vec<_>>();
            (has_th, cells)
        });
        let Some((_, headers)) = rows.by_ref().find(|(has_th, _)| *has_th) else {
            continue;
        };
        let rows = rows.map(|(_, cells)| cells).collect();
        return Some(PriceTable { headers, rows });
    }

    None
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn extract_first_text(doc: &Html, selector: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    for el in doc.select(&selector) {
        let text = element_text(el);
        if !text.is_empty() {
            return text;
        }
    }

    String::new()
}

pub(crate) fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
