#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use reqwest::Method;
use serde_json::{Value, json};

use kira_sync::cache::{BlobCache, CacheConfig};
use kira_sync::download::{DownloadBackend, FetchRequest, copy_limited};
use kira_sync::error::KiraError;
use kira_sync::progress::ProgressTracker;
use kira_sync::session::Session;
use kira_sync::transport::{Transport, UrlOptions, clean_url};
use kira_sync::upload::PartUploader;

pub const ENDPOINT: &str = "https://backend.test/api";

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

/// Answers requests from per-route queues; the last queued answer repeats.
/// Unscripted routes answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Result<Value, u16>>>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: Method, url: &str, body: Value) {
        self.push(method, url, Ok(body));
    }

    pub fn fail(&self, method: Method, url: &str, status: u16) {
        self.push(method, url, Err(status));
    }

    fn push(&self, method: Method, url: &str, answer: Result<Value, u16>) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, url.to_string()))
            .or_default()
            .push_back(answer);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method && call.url == url)
            .count()
    }

    pub fn count_method(&self, method: Method) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    pub fn bodies(&self, method: Method, url: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method && call.url == url)
            .filter_map(|call| call.body.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    fn endpoint_url(&self) -> &str {
        ENDPOINT
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        options: &UrlOptions,
        body: Option<&Value>,
    ) -> Result<Value, KiraError> {
        let url = clean_url(ENDPOINT, url, options);
        self.calls.lock().unwrap().push(Call {
            method: method.clone(),
            url: url.clone(),
            body: body.cloned(),
        });

        let mut routes = self.routes.lock().unwrap();
        let answer = match routes.get_mut(&(method, url.clone())) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match answer {
            Some(Ok(value)) => Ok(value),
            Some(Err(status)) => Err(KiraError::from_status(status, format!("scripted {url}"))
                .unwrap_or_else(|| KiraError::Http(format!("bad scripted status {status}")))),
            None => Err(KiraError::from_status(404, format!("no route for {url}"))
                .unwrap_or_else(|| KiraError::Http(url))),
        }
    }
}

pub fn session(transport: &Arc<MockTransport>, cache: BlobCache) -> Session {
    let shared: Arc<dyn Transport> = transport.clone();
    Session::from_shared(shared, cache)
}

pub fn uncached_session(transport: &Arc<MockTransport>) -> Session {
    session(transport, BlobCache::disabled())
}

pub fn cached_session(transport: &Arc<MockTransport>, root: &Path) -> Session {
    let root = camino::Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap();
    session(transport, BlobCache::new(CacheConfig::new(root)))
}

pub fn org_blob(uuid: &str, name: &str) -> Value {
    json!({
        "uuid": uuid,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "name": name,
    })
}

pub fn project_blob(uuid: &str, name: &str) -> Value {
    json!({
        "uuid": uuid,
        "created_at": "2024-01-01T00:00:00Z",
        "name": name,
        "description": name,
        "privacy_level": "private",
    })
}

pub fn sample_blob(uuid: &str, name: &str, project_uuid: &str, metadata: Value) -> Value {
    json!({
        "uuid": uuid,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "name": name,
        "metadata": metadata,
        "library": project_uuid,
        "description": "",
    })
}

pub fn folder_blob(uuid: &str, module: &str) -> Value {
    json!({
        "uuid": uuid,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "module_name": module,
        "replicate": null,
        "description": "",
        "is_private": false,
    })
}

pub fn file_blob(uuid: &str, name: &str, stored_data: Value) -> Value {
    json!({
        "uuid": uuid,
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "name": name,
        "stored_data": stored_data,
    })
}

/// Scripts a fetched chain `lab / soil / s1 / kraken` and returns the folder URL
/// prefix used by result files inside it.
pub fn script_sample_chain(transport: &MockTransport) {
    transport.respond(Method::GET, "nested/lab", org_blob("org-1", "lab"));
    transport.respond(
        Method::GET,
        "nested/lab/sample_groups/soil",
        project_blob("proj-1", "soil"),
    );
    transport.respond(
        Method::GET,
        "nested/lab/sample_groups/soil/samples/s1",
        sample_blob("sample-1", "s1", "proj-1", json!({})),
    );
    transport.respond(
        Method::GET,
        "nested/lab/sample_groups/soil/samples/s1/analysis_results/kraken",
        folder_blob("folder-1", "kraken"),
    );
}

/// Records every part it receives and answers with a predictable ETag.
#[derive(Default)]
pub struct RecordingParts {
    parts: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingParts {
    pub fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.parts.lock().unwrap().clone()
    }

    /// Bytes in signed-URL order, `https://s3.test/part/<n>`.
    pub fn reassembled(&self) -> Vec<u8> {
        let mut parts = self.received();
        parts.sort_by_key(|(url, _)| part_number(url));
        parts.into_iter().flat_map(|(_, data)| data).collect()
    }
}

impl PartUploader for RecordingParts {
    fn put_part(&self, url: &str, data: Vec<u8>) -> Result<String, KiraError> {
        let etag = format!("\"etag-{}\"", part_number(url));
        self.parts.lock().unwrap().push((url.to_string(), data));
        Ok(etag)
    }
}

/// Fails every attempt with a 500.
#[derive(Default)]
pub struct FailingParts {
    attempts: Mutex<usize>,
}

impl FailingParts {
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl PartUploader for FailingParts {
    fn put_part(&self, url: &str, _data: Vec<u8>) -> Result<String, KiraError> {
        *self.attempts.lock().unwrap() += 1;
        Err(KiraError::from_status(500, format!("storage down for {url}"))
            .unwrap_or_else(|| KiraError::Http(url.to_string())))
    }
}

/// Fails the first attempt at every part with a 500, then accepts it.
#[derive(Default)]
pub struct FlakyParts {
    attempts: Mutex<HashMap<u32, usize>>,
}

impl FlakyParts {
    pub fn attempts(&self, part: u32) -> usize {
        self.attempts.lock().unwrap().get(&part).copied().unwrap_or(0)
    }
}

impl PartUploader for FlakyParts {
    fn put_part(&self, url: &str, _data: Vec<u8>) -> Result<String, KiraError> {
        let part = part_number(url);
        let mut attempts = self.attempts.lock().unwrap();
        let seen = attempts.entry(part).or_insert(0);
        *seen += 1;
        if *seen == 1 {
            return Err(KiraError::from_status(500, format!("storage hiccup for {url}"))
                .unwrap_or_else(|| KiraError::Http(url.to_string())));
        }
        Ok(format!("\"etag-{part}\""))
    }
}

pub fn part_number(url: &str) -> u32 {
    url.rsplit('/').next().and_then(|n| n.parse().ok()).unwrap_or(0)
}

/// Signed URL map for `count` parts.
pub fn signed_urls(count: u32) -> Value {
    let map = (1..=count)
        .map(|n| (n.to_string(), json!(format!("https://s3.test/part/{n}"))))
        .collect::<serde_json::Map<_, _>>();
    Value::Object(map)
}

/// Serves fixed bytes for any URL and remembers what it was asked.
pub struct BytesBackend {
    content: Vec<u8>,
    requests: Mutex<Vec<(String, Option<u64>, bool)>>,
}

impl BytesBackend {
    pub fn new(content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            content,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(String, Option<u64>, bool)> {
        self.requests.lock().unwrap().clone()
    }
}

impl DownloadBackend for BytesBackend {
    fn fetch(&self, request: &FetchRequest<'_>, progress: &dyn ProgressTracker) -> Result<u64, KiraError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.url.to_string(), request.head, request.resume));
        progress.set_total(self.content.len() as u64);
        let mut file = std::fs::File::create(request.target).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut reader = self.content.as_slice();
        copy_limited(&mut reader, &mut file, request.head, progress)
            .map_err(|err| KiraError::Download(err.to_string()))
    }
}

/// Counts what a transfer reported.
#[derive(Default)]
pub struct CountingProgress {
    pub total: Mutex<u64>,
    pub advanced: Mutex<u64>,
    pub steps: Mutex<usize>,
}

impl ProgressTracker for CountingProgress {
    fn set_total(&self, total: u64) {
        *self.total.lock().unwrap() = total;
    }

    fn advance(&self, bytes: u64) {
        *self.advanced.lock().unwrap() += bytes;
        *self.steps.lock().unwrap() += 1;
    }
}

/// Minimal HTTP/1.1 file server on a loopback port. Records the `Range`
/// header of every request and, when `honour_range` is set, answers ranges
/// with 206 or 416 the way object storage does.
pub struct RangeServer {
    pub url: String,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangeServer {
    pub fn start(content: &[u8], honour_range: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/bucket/reads.fastq", listener.local_addr().unwrap());
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let content = content.to_vec();
        let seen = Arc::clone(&ranges);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let range = read_range_header(&stream);
                seen.lock().unwrap().push(range.clone());
                let range = range.filter(|_| honour_range);
                serve(stream, &content, range.as_deref());
            }
        });
        Self { url, ranges }
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

fn read_range_header(stream: &TcpStream) -> Option<String> {
    let mut reader = BufReader::new(stream);
    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    range
}

fn serve(mut stream: TcpStream, content: &[u8], range: Option<&str>) {
    let len = content.len();
    let (status, extra, body) = match range.and_then(|range| range.strip_prefix("bytes=")) {
        None => ("200 OK", String::new(), content),
        Some(spec) => {
            let (start, end) = spec.split_once('-').unwrap();
            let start: usize = start.parse().unwrap();
            if start >= len {
                ("416 Range Not Satisfiable", format!("Content-Range: bytes */{len}\r\n"), &content[..0])
            } else {
                let end = end.parse::<usize>().map_or(len - 1, |end| end.min(len - 1));
                (
                    "206 Partial Content",
                    format!("Content-Range: bytes {start}-{end}/{len}\r\n"),
                    &content[start..=end],
                )
            }
        }
    };
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}
