// src/fetch/mod.rs

//! The HTTP fetch pipeline.
//!
//! All network I/O in the crate funnels through [`Fetch`]: a retrying,
//! streaming client with a global concurrency gate, metadata headers for the
//! configured hosted registry, stall and size limits, and CRC32C validation
//! of response bodies. Callers describe a request with [`FetchRequest`] and
//! supply a decode function that consumes the whole response stream.
//!
//! Transport is abstracted behind [`HttpTransport`] so tests can script
//! responses without sockets; production uses [`ReqwestTransport`].

mod checksum;
mod tokens;

pub use checksum::{parse_crc32c_header, Crc32cMismatch, Crc32cReader, GOOG_HASH_HEADER};
pub use tokens::{TokenStore, TOKEN_FILE};

use rand::Rng;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Default hosted registry origin; overridden by `KEEL_HOSTED_URL`.
pub const DEFAULT_HOSTED_URL: &str = "https://packages.keel-lang.org";

/// Accept header for versioned registry API requests.
pub const API_ACCEPT: &str = "application/vnd.keel.v2+json";

/// All network-bound work across the process shares this many slots.
pub const MAX_CONCURRENT_REQUESTS: usize = 16;

/// Default retry budget; overridden by `KEEL_MAX_HTTP_RETRIES`.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// How long response headers may take to arrive.
const HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// How often throughput is sampled while streaming a body.
const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A transfer whose projected remaining time exceeds this is a stall.
const MAX_PROJECTED_REMAINING: Duration = Duration::from_secs(3 * 60 * 60);

/// A `Retry-After` longer than this is not worth waiting for.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);

/// Cap on how much of an error response body is read for the message.
const ERROR_BODY_LIMIT: u64 = 64 * 1024;

/// Errors produced by the fetch pipeline.
///
/// Retryable variants are caught by the retry loop inside [`Fetch::run`];
/// everything else propagates to the caller on first occurrence.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("could not connect to {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("transfer from {url} stalled; giving up")]
    Stalled { url: String },

    #[error("{url} returned status {status}")]
    Server { url: String, status: u16 },

    #[error("checksum of the response from {url} did not match; the download may be corrupted")]
    ChecksumMismatch { url: String },

    #[error("{url} asked to slow down (retry after {} s)", .retry_after.as_secs())]
    RateLimited { url: String, retry_after: Duration },

    #[error("response from {url} was malformed: {reason}")]
    Format { url: String, reason: String },

    #[error("{url} responded with status {status}: {message}")]
    Response {
        url: String,
        status: u16,
        message: String,
    },

    #[error("the registry at {url} requires a newer client; please upgrade")]
    VersionOutdated { url: String },

    #[error("response from {url} is larger than the {limit}-byte limit")]
    TooLarge { url: String, limit: u64 },

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the retry loop may attempt this request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Connection { .. }
                | FetchError::Stalled { .. }
                | FetchError::Server { .. }
                | FetchError::ChecksumMismatch { .. }
                | FetchError::RateLimited { .. }
                | FetchError::Format { .. }
        )
    }

    /// Whether this error indicates the network or server is unavailable
    /// (maps to the "unavailable" process exit code).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FetchError::Connection { .. }
                | FetchError::Stalled { .. }
                | FetchError::Server { .. }
                | FetchError::RateLimited { .. }
        )
    }
}

/// Error returned by a decode function.
///
/// `Format` marks a malformed body (retryable: the server may serve a good
/// copy next time); `Other` is a caller-side failure and is not retried.
/// I/O errors are classified by the pipeline: stall and checksum markers
/// become their retryable [`FetchError`] variants, anything else counts as a
/// connection failure.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Format(String),

    #[error("{0}")]
    Other(String),
}

/// Error from the transport layer (connection refused, TLS failure, ...).
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TransportError(pub String);

/// A fully-built request handed to the transport.
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub follow_redirects: bool,
}

/// A response as seen by the pipeline: status line, headers, body stream.
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    pub body: Box<dyn Read + Send>,
}

/// The seam between the pipeline and the actual HTTP stack.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport over blocking reqwest.
///
/// Two clients are held so redirect policy can be chosen per request. The
/// connect timeout covers the header-arrival window; body timeouts are
/// enforced by the pipeline's stall detection instead of a wall-clock cap.
pub struct ReqwestTransport {
    redirecting: reqwest::blocking::Client,
    direct: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let build = |policy: reqwest::redirect::Policy| {
            reqwest::blocking::Client::builder()
                .connect_timeout(HEADER_TIMEOUT)
                .timeout(None)
                .redirect(policy)
                .build()
                .map_err(|e| TransportError(e.to_string()))
        };
        Ok(Self {
            redirecting: build(reqwest::redirect::Policy::limited(10))?,
            direct: build(reqwest::redirect::Policy::none())?,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = if request.follow_redirects {
            &self.redirecting
        } else {
            &self.direct
        };
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError(e.to_string()))?;
        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(TransportResponse {
            status,
            headers,
            body: Box::new(response),
        })
    }
}

/// Configuration for the pipeline, gathered once at startup.
///
/// This replaces ambient process-wide state: tests construct one directly
/// and production uses [`HttpConfig::from_env`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Origin of the default hosted registry.
    pub hosted_url: String,
    /// Retry budget per request (attempts = retries + 1).
    pub max_retries: u32,
    /// Truthy `CI` disables metadata headers.
    pub is_ci: bool,
    /// Value of `KEEL_ENVIRONMENT`, forwarded as a metadata header.
    pub environment: Option<String>,
    /// Name of the command being run, forwarded as a metadata header.
    pub command: Option<String>,
    /// Random id for this invocation, forwarded as a metadata header.
    pub session_id: String,
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let max_retries = std::env::var("KEEL_MAX_HTTP_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let hosted_url = std::env::var("KEEL_HOSTED_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_HOSTED_URL.to_string());
        let is_ci = std::env::var("CI")
            .map(|v| !v.is_empty() && v != "0" && v.to_ascii_lowercase() != "false")
            .unwrap_or(false);
        Self {
            hosted_url,
            max_retries,
            is_ci,
            environment: std::env::var("KEEL_ENVIRONMENT").ok(),
            command: None,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// A config suitable for tests: fixed session id, no environment tag.
    pub fn for_tests(hosted_url: impl Into<String>) -> Self {
        Self {
            hosted_url: hosted_url.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            is_ci: false,
            environment: None,
            command: None,
            session_id: "00000000-0000-0000-0000-000000000000".to_string(),
        }
    }
}

/// Counting semaphore gating all in-flight requests.
struct Gate {
    available: Mutex<usize>,
    freed: Condvar,
}

struct GatePermit<'a> {
    gate: &'a Gate,
}

impl Gate {
    fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) -> GatePermit<'_> {
        let mut available = self.available.lock().expect("gate poisoned");
        while *available == 0 {
            available = self.freed.wait(available).expect("gate poisoned");
        }
        *available -= 1;
        GatePermit { gate: self }
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut available = self.gate.available.lock().expect("gate poisoned");
        *available += 1;
        self.gate.freed.notify_one();
    }
}

/// Marker payload for stall failures inside an [`io::Error`].
#[derive(Debug)]
struct StallDetected;

impl fmt::Display for StallDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer stalled")
    }
}

impl std::error::Error for StallDetected {}

/// Whether a transfer window projects to more than the allowed remaining
/// time. A window with no progress at all always counts as stalled.
fn projects_past_limit(window_bytes: u64, window: Duration, remaining_bytes: u64) -> bool {
    if remaining_bytes == 0 {
        return false;
    }
    if window_bytes == 0 {
        return true;
    }
    let rate = window_bytes as f64 / window.as_secs_f64();
    remaining_bytes as f64 / rate > MAX_PROJECTED_REMAINING.as_secs_f64()
}

/// Reader that samples throughput once per [`STALL_CHECK_INTERVAL`] and,
/// when the projected remaining time exceeds the limit, marks the transfer
/// stalled and fails at the next yielded chunk.
struct StallReader<R> {
    inner: R,
    content_length: Option<u64>,
    total: u64,
    window_started: Instant,
    window_bytes: u64,
    stalled: bool,
}

impl<R: Read> StallReader<R> {
    fn new(inner: R, content_length: Option<u64>) -> Self {
        Self {
            inner,
            content_length,
            total: 0,
            window_started: Instant::now(),
            window_bytes: 0,
            stalled: false,
        }
    }
}

impl<R: Read> Read for StallReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stalled {
            return Err(io::Error::new(io::ErrorKind::TimedOut, StallDetected));
        }
        let n = self.inner.read(buf)?;
        self.total += n as u64;
        self.window_bytes += n as u64;
        let elapsed = self.window_started.elapsed();
        if elapsed >= STALL_CHECK_INTERVAL {
            if let Some(length) = self.content_length {
                let remaining = length.saturating_sub(self.total);
                if projects_past_limit(self.window_bytes, elapsed, remaining) {
                    self.stalled = true;
                }
            }
            self.window_started = Instant::now();
            self.window_bytes = 0;
        }
        Ok(n)
    }
}

/// Response metadata handed to decode functions.
pub struct ResponseInfo {
    pub status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseInfo {
    /// First header with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// The shared fetch pipeline.
pub struct Fetch {
    transport: Arc<dyn HttpTransport>,
    config: HttpConfig,
    tokens: TokenStore,
    gate: Gate,
    hosts_warned: Mutex<HashSet<String>>,
    cancelled: Arc<AtomicBool>,
    sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

impl Fetch {
    pub fn new(config: HttpConfig, transport: Arc<dyn HttpTransport>, tokens: TokenStore) -> Self {
        Self {
            transport,
            config,
            tokens,
            gate: Gate::new(MAX_CONCURRENT_REQUESTS),
            hosts_warned: Mutex::new(HashSet::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Pipeline over the production transport.
    pub fn with_defaults(config: HttpConfig, tokens: TokenStore) -> Result<Self, TransportError> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Ok(Self::new(config, transport, tokens))
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Flag checked at attempt boundaries; setting it makes in-flight
    /// requests fail with [`FetchError::Cancelled`] at their next attempt.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Replace the function used to sleep between retries. Tests use this
    /// to observe the back-off schedule without waiting it out.
    pub fn set_sleep_fn(&mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) {
        self.sleep = Box::new(sleep);
    }

    /// Start building a GET request.
    pub fn get(&self, url: impl Into<String>) -> FetchRequest<'_> {
        self.request("GET", url)
    }

    /// Start building a request with an explicit method.
    pub fn request(&self, method: &str, url: impl Into<String>) -> FetchRequest<'_> {
        FetchRequest {
            fetch: self,
            method: method.to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            max_bytes: None,
            follow_redirects: true,
            api_request: false,
            decode_error: None,
            dependency_type: None,
        }
    }

    fn build_headers(&self, request: &FetchRequest<'_>) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        headers.push((
            "user-agent".to_string(),
            format!("keel/{}", env!("CARGO_PKG_VERSION")),
        ));
        if request.api_request {
            headers.push(("accept".to_string(), API_ACCEPT.to_string()));
        }
        // Metadata headers go only to the configured hosted origin, and
        // never from CI.
        if url_within(&request.url, &self.config.hosted_url) && !self.config.is_ci {
            headers.push(("x-keel-os".to_string(), std::env::consts::OS.to_string()));
            headers.push((
                "x-keel-session-id".to_string(),
                self.config.session_id.clone(),
            ));
            if let Some(command) = &self.config.command {
                headers.push(("x-keel-command".to_string(), command.clone()));
            }
            if let Some(kind) = &request.dependency_type {
                headers.push(("x-keel-reason".to_string(), kind.clone()));
            }
            if let Some(env) = &self.config.environment {
                headers.push(("x-keel-environment".to_string(), env.clone()));
            }
        }
        if let Some(token) = self.tokens.token_for(&request.url) {
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
        }
        headers.extend(request.headers.iter().cloned());
        headers
    }

    fn warn_host_down(&self, url: &str) {
        let host = host_of(url).to_string();
        let mut warned = self.hosts_warned.lock().expect("warned set poisoned");
        if warned.insert(host.clone()) {
            warn!("the server at {host} does not seem to be responding; still retrying");
        }
    }
}

/// Whether `url` lives under `prefix`.
///
/// The prefix must match byte-for-byte and end at a URL boundary (`/`, `?`,
/// or end of string), so a lookalike host such as
/// `https://packages.test.evil.example` never matches a configured
/// `https://packages.test`. Credentials and metadata headers are attached
/// only when this holds; a redirect to any other origin loses them.
pub(crate) fn url_within(url: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match url.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Back-off before retry number `attempt` (0-based): a jittered exponential
/// curve for the first three retries, then a flat 30 seconds.
fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 2 {
        let base = 500.0 * 1.5_f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0..500);
        Duration::from_millis(base as u64 + jitter)
    } else {
        Duration::from_secs(30)
    }
}

/// Host portion of a URL, for user-facing messages.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split(['/', ':']).next().unwrap_or(rest)
}

/// A request under construction. Obtained from [`Fetch::get`] /
/// [`Fetch::request`], consumed by [`FetchRequest::run`].
pub struct FetchRequest<'f> {
    fetch: &'f Fetch,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Box<dyn Fn() -> Vec<u8> + Send + Sync>>,
    max_bytes: Option<u64>,
    follow_redirects: bool,
    api_request: bool,
    decode_error: Option<Box<dyn Fn(u16, &[u8]) -> Option<String> + Send + Sync>>,
    dependency_type: Option<String>,
}

impl<'f> FetchRequest<'f> {
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    /// Mark this as a versioned registry API request: sends the API Accept
    /// header and decodes `{"error": {"message": ...}}` bodies on 4xx.
    pub fn api(mut self) -> Self {
        self.api_request = true;
        self.decode_error = Some(Box::new(|_status, body| {
            #[derive(serde::Deserialize)]
            struct ErrorBody {
                error: ErrorMessage,
            }
            #[derive(serde::Deserialize)]
            struct ErrorMessage {
                message: String,
            }
            serde_json::from_slice::<ErrorBody>(body)
                .ok()
                .map(|b| b.error.message)
        }));
        self
    }

    /// Reject responses whose declared `content-length` exceeds `limit`.
    pub fn max_bytes(mut self, limit: u64) -> Self {
        self.max_bytes = Some(limit);
        self
    }

    /// Do not follow redirects; the decode function sees the 3xx response
    /// and can read its `location` header.
    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Attach a body. The factory is invoked once per attempt so retries
    /// upload a fresh copy.
    pub fn body(mut self, factory: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.body = Some(Box::new(factory));
        self
    }

    /// Custom extraction of an error message from 4xx bodies.
    pub fn decode_error(
        mut self,
        handler: impl Fn(u16, &[u8]) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.decode_error = Some(Box::new(handler));
        self
    }

    /// Tag the request with the dependency type that caused it; forwarded
    /// as a metadata header to the hosted origin.
    pub fn dependency_type(mut self, kind: impl Into<String>) -> Self {
        self.dependency_type = Some(kind.into());
        self
    }

    /// Execute the request, decoding the response stream with `decode`.
    ///
    /// `decode` must consume the entire stream (checksum validation fires at
    /// end of stream) and must be idempotent: it runs once per attempt and
    /// the result of a later attempt replaces any partial work of an earlier
    /// one.
    pub fn run<T>(
        self,
        mut decode: impl FnMut(&mut dyn Read, &ResponseInfo) -> Result<T, DecodeError>,
    ) -> Result<T, FetchError> {
        let fetch = self.fetch;
        let max_retries = fetch.config.max_retries;
        let mut attempt: u32 = 0;
        loop {
            if fetch.cancelled.load(Ordering::Relaxed) {
                return Err(FetchError::Cancelled);
            }
            let outcome = {
                let _permit = fetch.gate.acquire();
                self.attempt(&mut decode)
            };
            let (error, retry_after) = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("request to {} succeeded after {attempt} retries", self.url);
                    }
                    return Ok(value);
                }
                Err(outcome) => outcome,
            };
            if !error.is_retryable() || attempt >= max_retries {
                return Err(error);
            }
            let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
            debug!(
                "attempt {} for {} failed ({error}); retrying in {:?}",
                attempt + 1,
                self.url,
                delay
            );
            attempt += 1;
            // The third retry failing in a row is worth telling the user
            // about, once per host.
            if attempt == 4 {
                fetch.warn_host_down(&self.url);
            }
            (fetch.sleep)(delay);
        }
    }

    /// Convenience: decode the whole body as JSON.
    pub fn run_json<T: DeserializeOwned>(self) -> Result<T, FetchError> {
        self.run(|body, _info| {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)?;
            serde_json::from_slice(&buf).map_err(|e| DecodeError::Format(e.to_string()))
        })
    }

    /// One transport round trip. Returns the decoded value or the error plus
    /// an optional server-directed retry delay.
    fn attempt<T>(
        &self,
        decode: &mut impl FnMut(&mut dyn Read, &ResponseInfo) -> Result<T, DecodeError>,
    ) -> Result<T, (FetchError, Option<Duration>)> {
        let fetch = self.fetch;
        let request = TransportRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: fetch.build_headers(self),
            body: self.body.as_ref().map(|factory| factory()),
            follow_redirects: self.follow_redirects,
        };

        let response = fetch.transport.execute(request).map_err(|e| {
            (
                FetchError::Connection {
                    url: self.url.clone(),
                    reason: e.to_string(),
                },
                None,
            )
        })?;

        let info = ResponseInfo {
            status: response.status,
            headers: response.headers,
        };

        match info.status {
            // Redirects only reach us when follow_redirects is off; the
            // caller wants to read the location header itself.
            status if (200..300).contains(&status) || (300..400).contains(&status) => {
                self.decode_body(response.body, info, decode)
            }
            406 if self.api_request => Err((
                FetchError::VersionOutdated {
                    url: self.url.clone(),
                },
                None,
            )),
            429 => {
                let retry_after = info
                    .header("retry-after")
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                match retry_after {
                    Some(delay) if delay <= RETRY_AFTER_CAP => Err((
                        FetchError::RateLimited {
                            url: self.url.clone(),
                            retry_after: delay,
                        },
                        Some(delay),
                    )),
                    Some(delay) => Err((
                        FetchError::Response {
                            url: self.url.clone(),
                            status: 429,
                            message: format!(
                                "rate limited; server asked to wait {} s",
                                delay.as_secs()
                            ),
                        },
                        None,
                    )),
                    None => Err((
                        FetchError::RateLimited {
                            url: self.url.clone(),
                            retry_after: Duration::ZERO,
                        },
                        None,
                    )),
                }
            }
            status if (400..500).contains(&status) => {
                let mut body = Vec::new();
                let _ = response.body.take(ERROR_BODY_LIMIT).read_to_end(&mut body);
                let message = self
                    .decode_error
                    .as_ref()
                    .and_then(|handler| handler(status, &body))
                    .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());
                Err((
                    FetchError::Response {
                        url: self.url.clone(),
                        status,
                        message,
                    },
                    None,
                ))
            }
            status => Err((
                FetchError::Server {
                    url: self.url.clone(),
                    status,
                },
                None,
            )),
        }
    }

    fn decode_body<T>(
        &self,
        body: Box<dyn Read + Send>,
        info: ResponseInfo,
        decode: &mut impl FnMut(&mut dyn Read, &ResponseInfo) -> Result<T, DecodeError>,
    ) -> Result<T, (FetchError, Option<Duration>)> {
        let content_length = info.content_length();
        if let (Some(limit), Some(length)) = (self.max_bytes, content_length) {
            if length > limit {
                return Err((
                    FetchError::TooLarge {
                        url: self.url.clone(),
                        limit,
                    },
                    None,
                ));
            }
        }

        let expected_crc = info
            .header(GOOG_HASH_HEADER)
            .and_then(parse_crc32c_header);

        let mut reader: Box<dyn Read> = Box::new(StallReader::new(body, content_length));
        if let Some(expected) = expected_crc {
            reader = Box::new(Crc32cReader::new(reader, expected));
        }

        decode(&mut reader, &info).map_err(|e| (self.classify_decode_error(e), None))
    }

    fn classify_decode_error(&self, error: DecodeError) -> FetchError {
        match error {
            DecodeError::Io(e) => {
                if let Some(inner) = e.get_ref() {
                    if inner.is::<StallDetected>() {
                        return FetchError::Stalled {
                            url: self.url.clone(),
                        };
                    }
                    if inner.is::<Crc32cMismatch>() {
                        return FetchError::ChecksumMismatch {
                            url: self.url.clone(),
                        };
                    }
                }
                FetchError::Connection {
                    url: self.url.clone(),
                    reason: e.to_string(),
                }
            }
            DecodeError::Format(reason) => FetchError::Format {
                url: self.url.clone(),
                reason,
            },
            DecodeError::Other(reason) => FetchError::Decode {
                url: self.url.clone(),
                reason,
            },
        }
    }
}
