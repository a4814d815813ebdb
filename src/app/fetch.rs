//! Resilient page fetching.
//!
//! Every page request of a run goes through one [`Fetcher`]: it paces requests
//! across all workers, retries transient failures with capped exponential
//! backoff and full jitter, honours `Retry-After`, and on a 403 retries the same
//! attempt once with a hardened browser identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{self, HeaderMap, HeaderValue};
use scraper::Html;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::FetchConfig;
use super::error::{FetchError, FetchErrorKind, RunError, TransportError};

const RETRYABLE_STATUSES: [u16; 6] = [403, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdentity {
    /// Plain browser-like headers.
    Primary,
    /// Full browser header set with a cookie jar, used after a 403.
    Hardened,
}

/// What the transport saw for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: String::new(),
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, identity: ClientIdentity) -> Result<RawResponse, TransportError>;

    /// Whether a [`ClientIdentity::Hardened`] request is any different from a primary one.
    fn supports_hardened(&self) -> bool;
}

pub struct ReqwestTransport {
    primary: reqwest::Client,
    hardened: Option<reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, RunError> {
        let primary = reqwest::Client::builder()
            .default_headers(primary_headers(config)?)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        let hardened = if config.hardened {
            Some(
                reqwest::Client::builder()
                    .default_headers(hardened_headers(config)?)
                    .cookie_store(true)
                    .gzip(true)
                    .connect_timeout(config.connect_timeout)
                    .read_timeout(config.read_timeout)
                    .redirect(reqwest::redirect::Policy::limited(10))
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self { primary, hardened })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, RunError> {
    HeaderValue::from_str(value)
        .map_err(|e| RunError::Config(format!("invalid {name} header '{value}': {e}")))
}

fn primary_headers(config: &FetchConfig) -> Result<HeaderMap, RunError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, header_value("User-Agent", &config.user_agent)?);
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(header::REFERER, header_value("Referer", &config.referer)?);
    Ok(headers)
}

fn hardened_headers(config: &FetchConfig) -> Result<HeaderMap, RunError> {
    let mut headers = primary_headers(config)?;
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    Ok(headers)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, identity: ClientIdentity) -> Result<RawResponse, TransportError> {
        let client = match identity {
            ClientIdentity::Primary => &self.primary,
            ClientIdentity::Hardened => self.hardened.as_ref().unwrap_or(&self.primary),
        };

        let response = client.get(url).send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());
        let body = if response.status().is_success() {
            response.text().await?
        } else {
            String::new()
        };

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    fn supports_hardened(&self) -> bool {
        self.hardened.is_some()
    }
}

/// Global request spacing shared by every clone of a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct Pacer {
    spacing: Duration,
    next_slot: Arc<Mutex<Instant>>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Reserve the next start slot; the caller waits until it comes up.
    async fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock().await;
        let slot = (*next).max(Instant::now());
        *next = slot + self.spacing;
        slot
    }

    /// No request may start until `delay` after now.
    async fn hold_off(&self, delay: Duration) {
        let earliest = Instant::now() + delay;
        let mut next = self.next_slot.lock().await;
        if *next < earliest {
            *next = earliest;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl FetchedPage {
    pub fn document(&self) -> Html {
        Html::parse_document(&self.body)
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Upper bound of the jittered sleep after `attempt` (1-based).
pub fn backoff_cap(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    1u32.checked_shl(attempt.saturating_sub(1))
        .and_then(|factor| base_delay.checked_mul(factor))
        .map(|delay| delay.min(max_delay))
        .unwrap_or(max_delay)
}

/// Full jitter: uniform in `[0, backoff_cap(attempt)]`.
pub fn full_jitter<R: Rng + ?Sized>(
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    rng: &mut R,
) -> Duration {
    let cap = backoff_cap(attempt, base_delay, max_delay);
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let cap_nanos = u64::try_from(cap.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rng.gen_range(0..=cap_nanos))
}

/// Delay requested by a `Retry-After` header given in seconds, capped at `max_delay`.
/// HTTP-date values and garbage are ignored.
pub fn retry_after_delay(value: &str, max_delay: Duration) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs.min(max_delay.as_secs_f64())))
}

enum Outcome {
    Success(RawResponse),
    Retry {
        cause: String,
        retry_after: Option<String>,
    },
    Fail(FetchErrorKind, String),
}

fn classify(result: Result<RawResponse, TransportError>) -> Outcome {
    match result {
        Ok(resp) if (200..300).contains(&resp.status) => Outcome::Success(resp),
        Ok(resp) if is_retryable_status(resp.status) => Outcome::Retry {
            cause: format!("http {}", resp.status),
            retry_after: resp.retry_after,
        },
        Ok(resp) => Outcome::Fail(
            FetchErrorKind::Status(resp.status),
            format!("http {}", resp.status),
        ),
        Err(err) if err.is_retryable() => Outcome::Retry {
            cause: err.to_string(),
            retry_after: None,
        },
        Err(err) => Outcome::Fail(FetchErrorKind::Transport, err.to_string()),
    }
}

pub struct Fetcher<T: ?Sized> {
    config: Arc<FetchConfig>,
    transport: Arc<T>,
    pacer: Pacer,
    cancel: CancellationToken,
}

impl<T: ?Sized> Clone for Fetcher<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            pacer: self.pacer.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Transport + ?Sized> Fetcher<T> {
    pub fn new(config: FetchConfig, transport: Arc<T>, cancel: CancellationToken) -> Self {
        let pacer = Pacer::new(config.inter_request_delay);
        Self {
            config: Arc::new(config),
            transport,
            pacer,
            cancel,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_cause = String::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(FetchError::cancelled(url));
            }
            // Retries are spaced by their backoff alone; only a fresh request waits its turn.
            if attempt == 1 {
                let slot = self.pacer.reserve().await;
                self.sleep(slot.saturating_duration_since(Instant::now()), url)
                    .await?;
            }

            let retry_after = match classify(self.attempt(url).await) {
                Outcome::Success(resp) => {
                    self.pacer.hold_off(self.config.inter_request_delay).await;
                    debug!(url, attempt, bytes = resp.body.len(), "fetched");
                    return Ok(FetchedPage {
                        url: url.to_string(),
                        status: resp.status,
                        body: resp.body,
                    });
                }
                Outcome::Fail(kind, cause) => return Err(FetchError::new(kind, url, cause)),
                Outcome::Retry { cause, retry_after } => {
                    last_cause = cause;
                    retry_after
                }
            };

            if attempt == max_attempts {
                break;
            }

            let delay = retry_after
                .as_deref()
                .and_then(|v| retry_after_delay(v, self.config.max_delay))
                .unwrap_or_else(|| {
                    full_jitter(
                        attempt,
                        self.config.base_delay,
                        self.config.max_delay,
                        &mut rand::thread_rng(),
                    )
                });
            warn!(
                url,
                attempt,
                max_attempts,
                cause = %last_cause,
                delay_ms = delay.as_millis() as u64,
                "retrying"
            );
            self.sleep(delay, url).await?;
        }

        Err(FetchError::new(
            FetchErrorKind::Exhausted {
                attempts: max_attempts,
            },
            url,
            last_cause,
        ))
    }

    async fn attempt(&self, url: &str) -> Result<RawResponse, TransportError> {
        let resp = self.transport.get(url, ClientIdentity::Primary).await?;
        if resp.status == 403 && self.config.hardened && self.transport.supports_hardened() {
            debug!(url, "403 on primary identity, retrying hardened");
            return self.transport.get(url, ClientIdentity::Hardened).await;
        }
        Ok(resp)
    }

    async fn sleep(&self, delay: Duration, url: &str) -> Result<(), FetchError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(FetchError::cancelled(url)),
        }
    }
}
