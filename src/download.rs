use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use tracing::{debug, info};

use crate::error::KiraError;
use crate::ftp::FtpDownloader;
use crate::progress::ProgressTracker;
use crate::storage::{BackendKind, StoragePointer};
use crate::transport::{check_status, send_error};

pub const COMPLETE_MARKER_SUFFIX: &str = ".kira-complete";
pub const PARTIAL_MARKER_SUFFIX: &str = ".kira-partial";

/// One backend call: stream `url` into `target`.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub target: &'a Path,
    /// Stop after this many bytes and truncate the file there.
    pub head: Option<u64>,
    /// `target` holds the prefix of an earlier, interrupted download of the
    /// same pointer and may be continued.
    pub resume: bool,
}

/// Moves bytes from one kind of remote storage to a local file.
pub trait DownloadBackend: Send + Sync {
    /// Returns the size of `target` once the transfer finishes.
    fn fetch(&self, request: &FetchRequest<'_>, progress: &dyn ProgressTracker) -> Result<u64, KiraError>;
}

/// Copies at most `limit` bytes, advancing `progress` per buffer.
pub fn copy_limited<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    progress: &dyn ProgressTracker,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let want = match limit {
            Some(limit) if written >= limit => break,
            Some(limit) => buffer.len().min((limit - written) as usize),
            None => buffer.len(),
        };
        let read = match reader.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        writer.write_all(&buffer[..read])?;
        written += read as u64;
        progress.advance(read as u64);
    }
    writer.flush()?;
    Ok(written)
}

/// Streaming HTTP GET, optionally sending `Range` headers.
#[derive(Clone)]
pub struct HttpDownloader {
    client: Client,
    ranged: bool,
}

impl HttpDownloader {
    /// For object storage that honours byte ranges.
    pub fn ranged(timeout: Duration) -> Result<Self, KiraError> {
        Self::build(timeout, true)
    }

    /// For servers that may not; always starts from byte zero.
    pub fn generic(timeout: Duration) -> Result<Self, KiraError> {
        Self::build(timeout, false)
    }

    fn build(timeout: Duration, ranged: bool) -> Result<Self, KiraError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("kira-sync/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| KiraError::Http(err.to_string()))?;
        Ok(Self { client, ranged })
    }

    fn resume_offset(&self, request: &FetchRequest<'_>) -> u64 {
        if !self.ranged || !request.resume || request.head.is_some() {
            return 0;
        }
        fs::metadata(request.target).map(|meta| meta.len()).unwrap_or(0)
    }
}

impl DownloadBackend for HttpDownloader {
    fn fetch(&self, request: &FetchRequest<'_>, progress: &dyn ProgressTracker) -> Result<u64, KiraError> {
        let offset = self.resume_offset(request);
        let mut builder = self.client.get(request.url);
        if self.ranged {
            match (request.head, offset) {
                (Some(0), _) => return truncate_to(request.target, 0),
                (Some(head), _) => builder = builder.header(RANGE, format!("bytes=0-{}", head - 1)),
                (None, offset) if offset > 0 => builder = builder.header(RANGE, format!("bytes={offset}-")),
                (None, _) => {}
            }
        }
        debug!(url = request.url, ranged = self.ranged, offset, head = ?request.head, "http download");

        let response = builder.send().map_err(send_error)?;
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!(target = %request.target.display(), "partial file already complete");
            return Ok(offset);
        }
        let mut response = check_status(response)?;

        // a plain 200 means the server ignored the range, so start over
        let appending = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let mut file = open_target(request.target, appending)?;
        let start = if appending { offset } else { 0 };
        if let Some(length) = response.content_length() {
            let total = start + length;
            progress.set_total(request.head.map_or(total, |head| head.min(total)));
        }
        if appending {
            progress.advance(offset);
        }

        let written = copy_limited(&mut response, &mut file, request.head, progress)
            .map_err(|err| KiraError::Download(format!("{}: {err}", request.url)))?;
        Ok(start + written)
    }
}

/// Picks a backend from the pointer kind and tracks completion markers.
#[derive(Clone)]
pub struct FileDownloader {
    ranged: Arc<dyn DownloadBackend>,
    ftp: Arc<dyn DownloadBackend>,
    generic: Arc<dyn DownloadBackend>,
}

impl FileDownloader {
    pub fn new(timeout: Duration) -> Result<Self, KiraError> {
        Ok(Self {
            ranged: Arc::new(HttpDownloader::ranged(timeout)?),
            ftp: Arc::new(FtpDownloader::new(timeout)),
            generic: Arc::new(HttpDownloader::generic(timeout)?),
        })
    }

    pub fn with_backends(
        ranged: Arc<dyn DownloadBackend>,
        ftp: Arc<dyn DownloadBackend>,
        generic: Arc<dyn DownloadBackend>,
    ) -> Self {
        Self {
            ranged,
            ftp,
            generic,
        }
    }

    pub fn backend(&self, kind: BackendKind) -> &dyn DownloadBackend {
        match kind {
            BackendKind::RangedHttp => self.ranged.as_ref(),
            BackendKind::Ftp => self.ftp.as_ref(),
            BackendKind::GenericHttp => self.generic.as_ref(),
        }
    }

    /// Downloads `pointer` into `target`.
    ///
    /// With `use_cache`, a target that already carries a completion marker is
    /// returned untouched, and a target left behind by an interrupted download
    /// (it carries a partial marker) is continued. Anything else at `target` is
    /// replaced. Head downloads never mark the file complete.
    pub fn download(
        &self,
        pointer: &StoragePointer,
        target: &Path,
        head: Option<u64>,
        use_cache: bool,
        progress: &dyn ProgressTracker,
    ) -> Result<PathBuf, KiraError> {
        let complete = is_complete(target);
        if use_cache && head.is_none() && complete {
            info!(target = %target.display(), "already downloaded");
            return Ok(target.to_path_buf());
        }
        if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| KiraError::Filesystem(format!("create {}: {err}", parent.display())))?;
        }
        remove_if_present(&marker_path(target))?;

        let partial = partial_marker_path(target);
        let resume = use_cache && head.is_none() && target.is_file() && partial.is_file();
        if head.is_none() {
            File::create(&partial).map_err(KiraError::filesystem)?;
        } else {
            remove_if_present(&partial)?;
        }

        let url = pointer.download_url()?;
        let kind = pointer.backend();
        info!(url = %url, backend = ?kind, target = %target.display(), resume, "downloading");
        let request = FetchRequest {
            url: &url,
            target,
            head,
            resume,
        };
        let size = self.backend(kind).fetch(&request, progress)?;
        debug!(target = %target.display(), size, "download finished");

        if head.is_none() {
            File::create(marker_path(target)).map_err(KiraError::filesystem)?;
            remove_if_present(&partial)?;
        }
        Ok(target.to_path_buf())
    }
}

pub fn marker_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(COMPLETE_MARKER_SUFFIX);
    PathBuf::from(name)
}

/// Present while a full download into `target` is in flight or was cut short.
pub fn partial_marker_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PARTIAL_MARKER_SUFFIX);
    PathBuf::from(name)
}

pub fn is_complete(target: &Path) -> bool {
    target.is_file() && marker_path(target).is_file()
}

fn remove_if_present(path: &Path) -> Result<(), KiraError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(KiraError::filesystem(err)),
    }
}

pub(crate) fn open_target(target: &Path, append: bool) -> Result<File, KiraError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(target)
        .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", target.display())))
}

fn truncate_to(target: &Path, size: u64) -> Result<u64, KiraError> {
    let file = open_target(target, false)?;
    file.set_len(size).map_err(KiraError::filesystem)?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::progress::NoProgress;

    #[test]
    fn copy_limited_stops_at_head() {
        let mut reader = Cursor::new(vec![1u8; 1000]);
        let mut out = Vec::new();
        let written = copy_limited(&mut reader, &mut out, Some(10), &NoProgress).unwrap();
        assert_eq!(written, 10);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn copy_limited_without_limit_copies_everything() {
        let mut reader = Cursor::new(vec![3u8; 200_000]);
        let mut out = Vec::new();
        let written = copy_limited(&mut reader, &mut out, None, &NoProgress).unwrap();
        assert_eq!(written, 200_000);
    }

    #[test]
    fn marker_sits_next_to_target() {
        let marker = marker_path(Path::new("/data/reads.fastq.gz"));
        assert_eq!(marker, PathBuf::from("/data/reads.fastq.gz.kira-complete"));
    }
}
