use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::error::{KiraError, RequestFailure};

pub type UrlOptions = BTreeMap<String, String>;

/// Thin request layer over the remote API.
///
/// Implementations resolve `url` relative to their endpoint, attach auth, and
/// map non-2xx responses to [`KiraError::Request`]. Empty bodies decode to
/// `Value::Null`.
pub trait Transport: Send + Sync {
    fn endpoint_url(&self) -> &str;

    fn request(
        &self,
        method: Method,
        url: &str,
        options: &UrlOptions,
        body: Option<&Value>,
    ) -> Result<Value, KiraError>;

    fn get(&self, url: &str, options: &UrlOptions) -> Result<Value, KiraError> {
        self.request(Method::GET, url, options, None)
    }

    fn post(&self, url: &str, body: &Value, options: &UrlOptions) -> Result<Value, KiraError> {
        self.request(Method::POST, url, options, Some(body))
    }

    fn put(&self, url: &str, body: &Value, options: &UrlOptions) -> Result<Value, KiraError> {
        self.request(Method::PUT, url, options, Some(body))
    }

    fn patch(&self, url: &str, body: &Value, options: &UrlOptions) -> Result<Value, KiraError> {
        self.request(Method::PATCH, url, options, Some(body))
    }

    fn delete(&self, url: &str, body: Option<&Value>) -> Result<Value, KiraError> {
        self.request(Method::DELETE, url, &UrlOptions::new(), body)
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint_url: String,
}

impl HttpTransport {
    pub fn new(config: &ResolvedConfig) -> Result<Self, KiraError> {
        Self::with_settings(
            &config.endpoint,
            config.api_token.as_deref(),
            config.request_timeout,
            config.verify_tls,
        )
    }

    pub fn with_settings(
        endpoint: &str,
        api_token: Option<&str>,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::InvalidConfig(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = api_token {
            let mut value = HeaderValue::from_str(&format!("Token {}", token.trim()))
                .map_err(|err| KiraError::InvalidConfig(err.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| KiraError::Http(err.to_string()))?;

        Ok(Self {
            client,
            endpoint_url: format!("{}/api", endpoint.trim_end_matches('/')),
        })
    }
}

impl Transport for HttpTransport {
    fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        options: &UrlOptions,
        body: Option<&Value>,
    ) -> Result<Value, KiraError> {
        let url = clean_url(&self.endpoint_url, url, options);
        let full_url = format!("{}/{}", self.endpoint_url, url);
        debug!(method = %method, url = %full_url, "sending request");

        let mut request = self.client.request(method, &full_url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().map_err(send_error)?;
        let response = check_status(response)?;
        let text = response.text().map_err(send_error)?;
        decode_body(&text)
    }
}

/// Passes 2xx responses through and maps everything else to the error taxonomy.
pub(crate) fn check_status(response: Response) -> Result<Response, KiraError> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    debug!(status, body = %body, "request failed");
    Err(KiraError::from_status(status, body)
        .unwrap_or_else(|| KiraError::Http(format!("unexpected status {status}"))))
}

/// Maps a call that produced no usable response. A per-call timeout is
/// reported as [`RequestFailure::Timeout`] with status 408.
pub(crate) fn send_error(err: reqwest::Error) -> KiraError {
    if err.is_timeout() {
        return KiraError::Request {
            kind: RequestFailure::Timeout,
            status: 408,
            body: err.to_string(),
        };
    }
    KiraError::Http(err.to_string())
}

/// Makes `url` relative to `endpoint_url` and appends `options` as a query.
pub fn clean_url(endpoint_url: &str, url: &str, options: &UrlOptions) -> String {
    let mut url = url.trim_end_matches('/');
    if let Some(stripped) = url.strip_prefix(endpoint_url) {
        url = stripped;
    }
    let mut url = url.trim_start_matches('/').to_string();
    if !options.is_empty() {
        let query = options
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&query);
    }
    url
}

pub fn decode_body(text: &str) -> Result<Value, KiraError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|err| KiraError::Decode(err.to_string()))
}

/// Lazily walks a `{"results": [...], "next": <url|null>}` listing.
pub struct Paginator<'a> {
    transport: &'a dyn Transport,
    next: Option<String>,
    options: UrlOptions,
    buffer: VecDeque<Value>,
}

impl<'a> Paginator<'a> {
    pub fn new(transport: &'a dyn Transport, url: impl Into<String>, options: UrlOptions) -> Self {
        Self {
            transport,
            next: Some(url.into()),
            options,
            buffer: VecDeque::new(),
        }
    }

    fn load_page(&mut self, url: &str) -> Result<(), KiraError> {
        let page = self.transport.get(url, &self.options)?;
        // follow-up `next` links already carry the query string
        self.options.clear();
        let results = page
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| KiraError::Decode(format!("page at {url} has no results array")))?;
        self.buffer.extend(results.iter().cloned());
        self.next = page
            .get("next")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(())
    }
}

impl Iterator for Paginator<'_> {
    type Item = Result<Value, KiraError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            let url = self.next.take()?;
            if let Err(err) = self.load_page(&url) {
                return Some(Err(err));
            }
        }
    }
}
