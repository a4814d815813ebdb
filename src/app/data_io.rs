use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use super::config::DataFormat;
use super::error::{Result, RunError};
use super::index::{IndexFigure, IndexSnapshot};
use super::types::CardValue;

const RANKING_HEADERS: [&str; 6] = ["rank", "value_usd", "avg10_usd", "pop10", "name", "url"];

pub const POP_WEIGHTED_HISTORY_HEADERS: [&str; 7] = [
    "run_timestamp_iso",
    "run_timestamp_local",
    "total_cards",
    "basket_size",
    "basket_sum_value_usd",
    "basket_total_pop10",
    "pk500_avg_usd",
];

pub const INDEX_LEVEL_HISTORY_HEADERS: [&str; 7] = [
    "run_timestamp_iso",
    "run_timestamp_local",
    "total_cards",
    "basket_size",
    "basket_sum_value_usd",
    "divisor",
    "index_level",
];

const DIVISOR_COLUMN: usize = 5;

#[derive(Debug, Clone, Serialize)]
struct RankingRecord<'a> {
    rank: usize,
    value_usd: f64,
    avg10_usd: f64,
    pop10: u64,
    name: &'a str,
    url: &'a str,
}

/// Writes a ranked card list (top-N or basket), rank 1-based.
pub fn write_ranking(path: &Path, format: DataFormat, cards: &[CardValue]) -> Result<()> {
    ensure_parent(path)?;
    match format {
        DataFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)?;
            writer.write_record(RANKING_HEADERS)?;
            for (i, card) in cards.iter().enumerate() {
                writer.write_record([
                    (i + 1).to_string(),
                    format!("{:.2}", card.value_usd),
                    format!("{:.2}", card.avg10_usd),
                    card.pop10.to_string(),
                    card.name.clone(),
                    card.url.clone(),
                ])?;
            }
            writer.flush()?;
        }
        DataFormat::Json => {
            let records = cards
                .iter()
                .enumerate()
                .map(|(i, card)| RankingRecord {
                    rank: i + 1,
                    value_usd: card.value_usd,
                    avg10_usd: card.avg10_usd,
                    pop10: card.pop10,
                    name: &card.name,
                    url: &card.url,
                })
                .collect::<Vec<_>>();
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, &records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
    }
    Ok(())
}

pub fn history_headers(figure: &IndexFigure) -> [&'static str; 7] {
    match figure {
        IndexFigure::PopWeighted { .. } => POP_WEIGHTED_HISTORY_HEADERS,
        IndexFigure::IndexLevel { .. } => INDEX_LEVEL_HISTORY_HEADERS,
    }
}

fn money_cell(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

pub fn history_row(snapshot: &IndexSnapshot) -> [String; 7] {
    let (weight_or_divisor, headline) = match snapshot.figure {
        IndexFigure::PopWeighted {
            total_pop10,
            average_usd,
        } => (total_pop10.to_string(), money_cell(average_usd)),
        IndexFigure::IndexLevel { divisor, level, .. } => (
            divisor.map(|d| d.to_string()).unwrap_or_default(),
            money_cell(level),
        ),
    };
    [
        snapshot.run.iso.clone(),
        snapshot.run.local.clone(),
        snapshot.total_cards.to_string(),
        snapshot.basket_size.to_string(),
        format!("{:.2}", snapshot.basket_sum_value),
        weight_or_divisor,
        headline,
    ]
}

/// Appends one run to the history log, creating it with a header when absent.
///
/// A new log is written to a temporary file and linked into place only if no
/// other run created it first, so the file is never visible without its
/// header. Rows for an existing log go out in a single append write.
pub fn append_history(path: &Path, snapshot: &IndexSnapshot) -> Result<()> {
    ensure_parent(path)?;
    let headers = history_headers(&snapshot.figure);
    let row = history_row(snapshot);

    if !path.exists() {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&encode_rows(Some(&headers), &row)?)?;
        staged.flush()?;
        match staged.persist_noclobber(path) {
            Ok(_) => return Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "history log created concurrently, appending");
            }
            Err(e) => return Err(e.error.into()),
        }
    }

    let header = verify_history(path, &headers)?;
    let mut file = OpenOptions::new().append(true).open(path)?;
    let bytes = if header.is_some() {
        encode_rows(None, &row)?
    } else {
        encode_rows(Some(&headers), &row)?
    };
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

fn encode_rows(headers: Option<&[&str; 7]>, row: &[String; 7]) -> Result<Vec<u8>> {
    let mut buf = csv::Writer::from_writer(Vec::new());
    if let Some(headers) = headers {
        buf.write_record(headers)?;
    }
    buf.write_record(row)?;
    buf.into_inner()
        .map_err(|e| RunError::Io(io::Error::other(e.to_string())))
}

fn read_history_header(path: &Path) -> Result<Option<csv::StringRecord>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut record = csv::StringRecord::new();
    if reader.read_record(&mut record)? {
        Ok(Some(record))
    } else {
        Ok(None)
    }
}

/// Fails when `path` exists with columns other than `expected`; returns the
/// header found, `None` for a missing or empty file.
pub fn verify_history(path: &Path, expected: &[&str; 7]) -> Result<Option<csv::StringRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    match read_history_header(path)? {
        None => Ok(None),
        Some(found) if found.iter().eq(expected.iter().copied()) => Ok(Some(found)),
        Some(found) => Err(RunError::History(format!(
            "{} has columns [{}], expected [{}]; use a separate file per summary mode",
            path.display(),
            found.iter().collect::<Vec<_>>().join(", "),
            expected.join(", ")
        ))),
    }
}

/// Divisor fixed by the first index-level run recorded in `path`, if any.
pub fn load_base_divisor(path: &Path) -> Result<Option<f64>> {
    if !path.exists() {
        return Ok(None);
    }
    verify_history(path, &INDEX_LEVEL_HISTORY_HEADERS)?;

    let mut reader = csv::Reader::from_path(path)?;
    for record in reader.records() {
        let record = record?;
        let divisor = record
            .get(DIVISOR_COLUMN)
            .and_then(|cell| cell.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0);
        if divisor.is_some() {
            return Ok(divisor);
        }
    }
    Ok(None)
}

/// `5040.0` → `"$5,040.00"`.
pub fn format_usd(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}${grouped}.{frac}")
}

fn format_count(value: u64) -> String {
    format_usd(value as f64)
        .trim_start_matches('$')
        .trim_end_matches(".00")
        .to_string()
}

pub fn render_top(top: &[CardValue]) -> String {
    let mut out = format!("=== TOP {} (by Grade10 AvgPrice*Pop) ===\n", top.len());
    for (i, card) in top.iter().enumerate() {
        out.push_str(&format!(
            "{:2}. {}  {}  ({})\n",
            i + 1,
            format_usd(card.value_usd),
            card.name,
            card.url
        ));
    }
    out
}

/// Human-readable run summary, shared by the console and `run_info.txt`.
pub fn render_summary(snapshot: &IndexSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run timestamp: {}\n", snapshot.run.local));
    out.push_str(&format!("Run timestamp ISO: {}\n", snapshot.run.iso));
    out.push_str(&format!("Total cards valued: {}\n", snapshot.total_cards));
    out.push_str(&format!(
        "Basket size used: {}  (rule: n<500 => top half, else top 500)\n",
        snapshot.basket_size
    ));
    out.push_str(&format!(
        "Basket sum value (USD, Σ avg10*pop10): {}\n",
        format_usd(snapshot.basket_sum_value)
    ));

    match snapshot.figure {
        IndexFigure::PopWeighted {
            total_pop10,
            average_usd,
        } => {
            out.push_str(&format!(
                "Basket total pop10 (Σ pop10): {}\n",
                format_count(total_pop10)
            ));
            out.push_str(&format!(
                "PK500-A (pop-weighted avg USD/PSA10): {}\n",
                average_usd.map(format_usd).unwrap_or_else(|| "N/A".into())
            ));
        }
        IndexFigure::IndexLevel {
            divisor,
            level,
            carried_forward,
        } => {
            let divisor = match divisor {
                Some(d) if carried_forward => format!("{d:.6} (carried forward)"),
                Some(d) => format!("{d:.6}"),
                None => "N/A".into(),
            };
            out.push_str(&format!("Divisor (10,000 base): {divisor}\n"));
            out.push_str(&format!(
                "Index level (base 10,000): {}\n",
                level
                    .map(|l| format_usd(l).trim_start_matches('$').to_string())
                    .unwrap_or_else(|| "N/A".into())
            ));
        }
    }
    out
}

/// Writes the summary plus any pages skipped in keep-going mode.
pub fn write_run_info(path: &Path, snapshot: &IndexSnapshot, failures: &[String]) -> Result<()> {
    ensure_parent(path)?;
    let mut text = render_summary(snapshot);
    if !failures.is_empty() {
        text.push_str(&format!("Skipped pages ({}):\n", failures.len()));
        for failure in failures {
            text.push_str(&format!("  {failure}\n"));
        }
    }
    fs::write(path, text)?;
    Ok(())
}

/// Where a run's files land.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub top: PathBuf,
    pub basket: PathBuf,
    pub run_info: PathBuf,
}

impl OutputPaths {
    pub fn new(out_dir: &Path, format: DataFormat, top_n: usize) -> Self {
        let ext = format.extension();
        Self {
            top: out_dir.join(format!("top{top_n}.{ext}")),
            basket: out_dir.join(format!("basket.{ext}")),
            run_info: out_dir.join("run_info.txt"),
        }
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
