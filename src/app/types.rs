use chrono::{DateTime, Local};

/// Top-grade valuation of one card page.
#[derive(Debug, Clone, PartialEq)]
pub struct CardValue {
    pub name: String,
    pub url: String,
    /// Population-weighted average realized price over the accepted top-grade rows.
    pub avg10_usd: f64,
    pub pop10: u64,
    /// `avg10_usd * pop10`; always positive.
    pub value_usd: f64,
}

impl CardValue {
    /// Builds a record from summed top-grade figures, or `None` when there is
    /// nothing to value.
    pub fn from_totals(
        name: impl Into<String>,
        url: impl Into<String>,
        value_usd: f64,
        pop10: u64,
    ) -> Option<Self> {
        if !value_usd.is_finite() || value_usd <= 0.0 || pop10 == 0 {
            return None;
        }
        Some(Self {
            name: name.into(),
            url: url.into(),
            avg10_usd: value_usd / pop10 as f64,
            pop10,
            value_usd,
        })
    }
}

/// One product set as listed on a population year page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetReference {
    pub year: u16,
    pub slug: String,
    pub id: String,
}

impl SetReference {
    /// The auction-prices listing for this set, which lives in a different
    /// namespace from the population page it was found on.
    pub fn auction_prices_url(&self, base_url: &str) -> String {
        format!(
            "{}/auctionprices/tcg-cards/{}/{}",
            base_url.trim_end_matches('/'),
            self.slug,
            self.id
        )
    }
}

/// Wall-clock identity of a run, captured once at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTimes {
    /// ISO-8601 with offset.
    pub iso: String,
    /// Human-readable local rendering.
    pub local: String,
}

impl RunTimes {
    pub fn now() -> Self {
        Self::from_datetime(Local::now())
    }

    pub fn from_datetime(at: DateTime<Local>) -> Self {
        Self {
            iso: at.to_rfc3339(),
            local: at.format("%Y-%m-%d %H:%M:%S %z").to_string(),
        }
    }
}
