use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::header::ETAG;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::chunker::FileChunker;
use crate::error::KiraError;
use crate::progress::ProgressTracker;
use crate::transport::{Transport, UrlOptions, check_status, send_error};

pub const FIVE_MB: u64 = 5 * 1024 * 1024;

/// Knobs for multipart transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: u64,
    pub max_retries: u32,
    pub threads: usize,
    /// Retry `n` of a part waits `backoff_unit * 10^n`.
    pub backoff_unit: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: FIVE_MB,
            max_retries: 3,
            threads: 1,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl TransferConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }
}

/// PUTs raw part bytes to a signed URL and returns the part's ETag.
pub trait PartUploader: Send + Sync {
    fn put_part(&self, url: &str, data: Vec<u8>) -> Result<String, KiraError>;
}

/// Talks to object storage directly, without the API's auth header.
#[derive(Clone)]
pub struct HttpPartUploader {
    client: Client,
}

impl HttpPartUploader {
    pub fn new(timeout: Duration) -> Result<Self, KiraError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("kira-sync/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| KiraError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl PartUploader for HttpPartUploader {
    fn put_part(&self, url: &str, data: Vec<u8>) -> Result<String, KiraError> {
        let response = self
            .client
            .put(url)
            .body(data)
            .send()
            .map_err(send_error)?;
        check_status(response)?
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| KiraError::Decode("part upload response has no ETag header".to_string()))
    }
}

/// Whether the uploaded file belongs to a sample or a project folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Sample,
    Group,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Sample => "sample",
            ResultType::Group => "group",
        }
    }
}

/// The result file an upload session is opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub field_uuid: String,
    pub result_type: ResultType,
}

impl UploadTarget {
    fn url(&self, action: &str) -> String {
        format!("ar_fields/{}/{action}", self.field_uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedPart {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub size: u64,
    pub md5_checksum: String,
}

/// Drives one multipart upload session from start to finalize.
pub struct MultipartUploader<'a> {
    transport: &'a dyn Transport,
    parts: &'a dyn PartUploader,
    config: TransferConfig,
}

impl<'a> MultipartUploader<'a> {
    pub fn new(transport: &'a dyn Transport, parts: &'a dyn PartUploader, config: TransferConfig) -> Self {
        Self {
            transport,
            parts,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn upload(
        &self,
        target: &UploadTarget,
        path: &Path,
        mut optional_fields: Map<String, Value>,
        progress: &dyn ProgressTracker,
    ) -> Result<UploadReceipt, KiraError> {
        let chunker = FileChunker::open(path, self.config.chunk_size)?;
        let md5_checksum = md5_file(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(file = %path.display(), size = chunker.size(), parts = chunker.part_count(), "starting multipart upload");

        optional_fields.insert("md5_checksum".to_string(), json!(md5_checksum));
        optional_fields.insert("file_size_bytes".to_string(), json!(chunker.size()));
        let session = self.transport.post(
            &target.url("create_upload"),
            &json!({
                "filename": filename,
                "optional_fields": optional_fields,
                "result_type": target.result_type.as_str(),
            }),
            &UrlOptions::new(),
        )?;
        let upload_id = upload_id(&session)?;

        let part_numbers: Vec<u32> = (1..=chunker.part_count()).collect();
        let urls = self.transport.post(
            &target.url("create_upload_urls"),
            &json!({
                "parts": part_numbers,
                "upload_id": upload_id,
                "stance": "upload-multipart",
                "result_type": target.result_type.as_str(),
            }),
            &UrlOptions::new(),
        )?;
        let signed: Vec<(u32, String)> = part_numbers
            .iter()
            .map(|number| Ok((*number, signed_url(&urls, *number)?)))
            .collect::<Result<_, KiraError>>()?;

        progress.set_total(chunker.size());
        let mut completed = self.upload_parts(&chunker, &signed, progress)?;
        completed.sort_by_key(|part| part.part_number);
        if completed.len() != part_numbers.len() {
            return Err(KiraError::IncompleteUpload(format!(
                "{} of {} parts uploaded",
                completed.len(),
                part_numbers.len()
            )));
        }

        self.transport.post(
            &target.url("complete_upload"),
            &json!({
                "parts": completed,
                "upload_id": upload_id,
                "result_type": target.result_type.as_str(),
            }),
            &UrlOptions::new(),
        )?;
        info!(file = %path.display(), "finished multipart upload");

        Ok(UploadReceipt {
            upload_id,
            parts: completed,
            size: chunker.size(),
            md5_checksum,
        })
    }

    fn upload_parts(
        &self,
        chunker: &FileChunker,
        signed: &[(u32, String)],
        progress: &dyn ProgressTracker,
    ) -> Result<Vec<CompletedPart>, KiraError> {
        let upload = |(number, url): &(u32, String)| -> Result<CompletedPart, KiraError> {
            let part = self.upload_one_part(chunker, *number, url)?;
            let (start, end) = chunker.part_range(*number);
            progress.advance(end - start);
            debug!(part = number, total = signed.len(), "uploaded part");
            Ok(part)
        };

        if self.config.threads <= 1 {
            debug!(file = %chunker.path().display(), "uploading parts in series");
            return signed.iter().map(upload).collect();
        }

        debug!(file = %chunker.path().display(), threads = self.config.threads, "uploading parts in parallel");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|err| KiraError::IncompleteUpload(err.to_string()))?;
        pool.install(|| signed.par_iter().map(upload).collect())
    }

    fn upload_one_part(
        &self,
        chunker: &FileChunker,
        number: u32,
        url: &str,
    ) -> Result<CompletedPart, KiraError> {
        let max_retries = self.config.max_retries.max(1);
        let mut attempts = 0u32;
        loop {
            let data = chunker.read_part(number)?;
            match self.parts.put_part(url, data) {
                Ok(etag) => {
                    return Ok(CompletedPart {
                        etag,
                        part_number: number,
                    });
                }
                Err(err) => {
                    attempts += 1;
                    warn!(part = number, attempt = attempts, max_retries, error = %err, "part upload failed");
                    if attempts >= max_retries {
                        return Err(KiraError::PartUpload {
                            part: number,
                            attempts,
                            message: err.to_string(),
                        });
                    }
                    thread::sleep(backoff(self.config.backoff_unit, attempts));
                }
            }
        }
    }
}

/// Delay before retrying after the `attempt`-th failure.
pub fn backoff(unit: Duration, attempt: u32) -> Duration {
    unit.saturating_mul(10u32.saturating_pow(attempt))
}

pub fn md5_file(path: &Path) -> Result<String, KiraError> {
    let mut file = File::open(path)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(KiraError::filesystem)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

fn upload_id(session: &Value) -> Result<String, KiraError> {
    session
        .get("upload_id")
        .and_then(|value| match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .ok_or_else(|| KiraError::Decode(format!("create_upload returned no upload_id: {session}")))
}

fn signed_url(urls: &Value, part_number: u32) -> Result<String, KiraError> {
    urls.get(part_number.to_string())
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| KiraError::IncompleteUpload(format!("no signed URL for part {part_number}")))
}
