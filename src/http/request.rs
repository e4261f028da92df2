//! The request executor: one HTTP transaction with bounded retries, a
//! wall-clock deadline, cancellation, and hook callbacks.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::config::Config;
use crate::http::hook::RequestHook;
use crate::http::stats;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    fn takes_body(&self) -> bool {
        matches!(self, Method::Put | Method::Post)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response headers: insertion-ordered, names compared case-insensitively,
/// case preserved as received.
#[derive(Debug, Clone, Default)]
pub struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_string();
        } else {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    /// Parse one raw header line: strip trailing CR/LF, split at the first
    /// ':', trim a single leading space from the value. Lines without ':'
    /// are ignored; returns whether the line was stored.
    pub fn insert_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some((name, rest)) = line.split_once(':') else {
            return false;
        };
        let value = rest.strip_prefix(' ').unwrap_or(rest);
        self.insert(name, value);
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One attempt as handed to the transport.
pub struct TransportRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
    pub timeout: Duration,
}

pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum TransportError {
    /// DNS, connect, SSL, partial transfer, send/recv, decode. Retried.
    Retryable(String),
    /// The attempt outlived its deadline.
    TimedOut,
    /// Malformed request; retrying cannot help.
    Fatal(String),
}

/// Seam between the executor's retry state machine and the wire. The
/// production implementation wraps a reqwest blocking client; tests run the
/// whole engine against an in-memory store.
pub trait Transport: Send + Sync {
    fn perform(
        &self,
        req: &TransportRequest<'_>,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Production transport: one live reqwest session, reused across
/// transactions.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(ssl_ca_file: Option<&Path>) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(path) = ssl_ca_file {
            let pem = std::fs::read(path)
                .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("bad CA file {}: {e}", path.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn perform(
        &self,
        req: &TransportRequest<'_>,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let method = match req.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, req.url).timeout(req.timeout);
        for (name, value) in req.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Fatal(format!("bad header name {name}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| TransportError::Fatal(format!("bad header value: {e}")))?;
            builder = builder.header(name, value);
        }
        if req.method.takes_body() {
            builder = builder.body(req.body.to_vec());
        }

        let response = builder.send().map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(n, v)| Some((n.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .bytes()
            .map_err(classify_reqwest_error)?
            .to_vec();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::TimedOut
    } else if err.is_builder() {
        TransportError::Fatal(err.to_string())
    } else {
        // Connect, request, body, and decode failures all map to the
        // transport-retryable class.
        TransportError::Retryable(err.to_string())
    }
}

/// Executes HTTP transactions. One instance per worker; never shared across
/// threads. A deadline expiry or explicit cancellation is terminal: the
/// instance rejects all further use and its worker replaces it.
pub struct HttpRequest {
    transport: Arc<dyn Transport>,
    hook: Option<Arc<dyn RequestHook>>,
    max_transfer_retries: u32,
    default_timeout: Duration,
    verbose: bool,

    method: Option<Method>,
    url: String,
    target_url: String,
    headers: Vec<(String, String)>,
    input: Vec<u8>,
    output: Vec<u8>,
    response_headers: HeaderBag,
    response_code: u16,
    last_modified: Option<SystemTime>,
    canceled: bool,

    run_count: u64,
    total_run_time: Duration,
    total_bytes: u64,
}

impl HttpRequest {
    pub fn new(config: &Config, hook: Option<Arc<dyn RequestHook>>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.ssl_ca_file.as_deref())?);
        Ok(Self::with_transport(transport, config, hook))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: &Config,
        hook: Option<Arc<dyn RequestHook>>,
    ) -> Self {
        Self {
            transport,
            hook,
            max_transfer_retries: config.max_transfer_retries,
            default_timeout: config.request_timeout(),
            verbose: config.verbose_requests,
            method: None,
            url: String::new(),
            target_url: String::new(),
            headers: Vec::new(),
            input: Vec::new(),
            output: Vec::new(),
            response_headers: HeaderBag::new(),
            response_code: 0,
            last_modified: None,
            canceled: false,
            run_count: 0,
            total_run_time: Duration::ZERO,
            total_bytes: 0,
        }
    }

    /// Reset per-transaction state. The underlying session survives.
    pub fn init(&mut self, method: Method) -> Result<()> {
        if self.canceled {
            return Err(Error::Canceled.into());
        }
        self.method = Some(method);
        self.url.clear();
        self.target_url.clear();
        self.headers.clear();
        self.input.clear();
        self.output.clear();
        self.response_headers.clear();
        self.response_code = 0;
        self.last_modified = None;
        Ok(())
    }

    pub fn set_hook(&mut self, hook: Option<Arc<dyn RequestHook>>) {
        self.hook = hook;
    }

    pub fn set_url(&mut self, url: &str, query: &str) {
        let adjusted = match &self.hook {
            Some(hook) => hook.adjust_url(url),
            None => url.to_string(),
        };
        self.target_url = if query.is_empty() {
            adjusted
        } else {
            let sep = if adjusted.contains('?') { '&' } else { '?' };
            format!("{adjusted}{sep}{query}")
        };
        self.url = url.to_string();
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hook-adjusted URL with query string, as sent to the transport.
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Set a request header, replacing any existing value for the same name.
    /// Insertion order is preserved on the wire.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn request_headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Body for PUT/POST. Misuse on other methods is a programmer error.
    pub fn set_input_buffer(&mut self, bytes: Vec<u8>) -> Result<()> {
        let method = self
            .method
            .ok_or_else(|| Error::InvalidArgument("set_input_buffer before init".into()))?;
        if !bytes.is_empty() && !method.takes_body() {
            return Err(Error::InvalidArgument(format!(
                "input buffer not allowed for {method}"
            ))
            .into());
        }
        self.input = bytes;
        Ok(())
    }

    pub fn input_buffer(&self) -> &[u8] {
        &self.input
    }

    pub fn response_code(&self) -> u16 {
        self.response_code
    }

    pub fn response_headers(&self) -> &HeaderBag {
        &self.response_headers
    }

    pub fn output_bytes(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// Terminal. A canceled executor rejects all further operations.
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn run(&mut self) -> Result<()> {
        self.run_with_timeout(self.default_timeout)
    }

    /// Execute the transaction with up to `max_transfer_retries` attempts
    /// against a single wall-clock deadline. An HTTP status >= 300 (other
    /// than 404) is logged but still returns `Ok`; callers inspect
    /// `response_code`.
    pub fn run_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        let method = self
            .method
            .ok_or_else(|| Error::InvalidArgument("run before init".into()))?;
        if self.target_url.is_empty() {
            return Err(Error::InvalidArgument("run before set_url".into()).into());
        }
        if self.canceled {
            return Err(Error::Canceled.into());
        }

        let hook = self.hook.clone();
        let deadline = Instant::now() + timeout;
        let mut elapsed = Duration::ZERO;
        let mut bytes_transferred = 0u64;
        let mut attempts_used = 0u64;
        let mut last_transport_error: Option<String> = None;

        for attempt in 0..self.max_transfer_retries {
            self.output.clear();
            self.response_headers.clear();
            self.response_code = 0;

            if let Some(hook) = &hook {
                hook.pre_run(self, attempt)?;
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => {
                    warn!(method = %method, url = %self.url, "request deadline expired");
                    self.canceled = true;
                    stats::note_timeout();
                    return Err(Error::TimedOut.into());
                }
            };

            let request_size = self.input.len() as u64
                + self
                    .headers
                    .iter()
                    .map(|(n, v)| (n.len() + v.len() + 2) as u64)
                    .sum::<u64>();

            if self.verbose {
                debug!(method = %method, url = %self.target_url, attempt, "sending request");
            }

            let started = Instant::now();
            let result = self.transport.perform(&TransportRequest {
                method,
                url: &self.target_url,
                headers: &self.headers,
                body: &self.input,
                timeout: remaining,
            });
            attempts_used = attempt as u64 + 1;

            match result {
                Err(TransportError::TimedOut) => {
                    warn!(method = %method, url = %self.url, "timed out");
                    self.canceled = true;
                    stats::note_timeout();
                    return Err(Error::TimedOut.into());
                }
                Err(TransportError::Fatal(msg)) => {
                    stats::note_abort();
                    return Err(Error::Aborted(msg).into());
                }
                Err(TransportError::Retryable(msg)) => {
                    stats::note_transport_failure();
                    warn!(method = %method, url = %self.url, error = %msg, "transport error; retrying");
                    last_transport_error = Some(msg);
                    continue;
                }
                Ok(response) => {
                    last_transport_error = None;
                    self.response_code = response.status;
                    for (name, value) in &response.headers {
                        self.response_headers.insert(name, value);
                    }
                    self.last_modified = self
                        .response_headers
                        .get("Last-Modified")
                        .and_then(parse_http_date);
                    self.output = response.body;

                    elapsed += started.elapsed();
                    bytes_transferred += request_size + self.output.len() as u64;

                    if let Some(hook) = &hook {
                        if hook.should_retry(self, attempt) {
                            stats::note_hook_retry();
                            debug!(method = %method, url = %self.url, attempt, "hook requested retry");
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        if let Some(msg) = last_transport_error {
            stats::note_abort();
            return Err(Error::Aborted(msg).into());
        }

        // The first request pays for connection warmup; keep it out of the
        // per-instance timing totals.
        if self.run_count > 0 {
            self.total_run_time += elapsed;
            self.total_bytes += bytes_transferred;
        }
        self.run_count += attempts_used;

        if self.response_code >= 300 && self.response_code != 404 {
            stats::note_request_failure();
            warn!(
                method = %method,
                url = %self.url,
                code = self.response_code,
                "request failed"
            );
        }

        Ok(())
    }
}

impl Drop for HttpRequest {
    fn drop(&mut self) {
        if self.total_bytes > 0 {
            stats::fold_totals(self.run_count, self.total_run_time, self.total_bytes);
        }
    }
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(SystemTime::from)
}
