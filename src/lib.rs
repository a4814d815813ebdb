//! Crawls graded-card auction prices and condenses the top-grade market into
//! one headline figure per run.

pub mod app;

pub use app::*;
