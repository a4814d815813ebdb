pub mod config;
pub mod crawl;
pub mod data_io;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod index;
pub mod logging;
pub mod runtime;
pub mod types;

pub use config::{CrawlConfig, DataFormat, FetchConfig, OutputConfig, RunConfig, SummaryMode};
pub use error::{FetchError, FetchErrorKind, Result, RunError, TransportError};
pub use fetch::{ClientIdentity, FetchedPage, Fetcher, RawResponse, ReqwestTransport, Transport};
pub use index::{Aggregate, IndexFigure, IndexSnapshot};
pub use runtime::{RunReport, run, run_pipeline};
pub use types::{CardValue, RunTimes, SetReference};
