use std::fs::File;
use std::io::{self, Read};
use std::net::ToSocketAddrs;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, warn};

use crate::download::{DownloadBackend, FetchRequest, copy_limited, open_target};
use crate::error::KiraError;
use crate::progress::ProgressTracker;

static FTP_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ftp://(?:([^:@/]+)(?::([^@/]*))?@)?([^/:]+)(?::(\d+))?(/.+)$").expect("static regex")
});

/// Parts of an `ftp://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpLocation {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl FtpLocation {
    pub fn parse(url: &str) -> Result<Self, KiraError> {
        let captures = FTP_URL
            .captures(url)
            .ok_or_else(|| KiraError::InvalidStoragePointer(format!("not an FTP URL: {url}")))?;
        let port = match captures.get(4) {
            Some(port) => port
                .as_str()
                .parse()
                .map_err(|_| KiraError::InvalidStoragePointer(format!("bad FTP port in {url}")))?,
            None => 21,
        };
        Ok(Self {
            user: captures
                .get(1)
                .map_or("anonymous", |user| user.as_str())
                .to_string(),
            password: captures.get(2).map_or("", |pass| pass.as_str()).to_string(),
            host: captures[3].to_string(),
            port,
            path: captures[5].to_string(),
        })
    }
}

/// Passive binary RETR. A head download hangs up once enough bytes arrive.
#[derive(Debug, Clone)]
pub struct FtpDownloader {
    timeout: Duration,
}

impl FtpDownloader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn connect(&self, location: &FtpLocation) -> Result<FtpStream, KiraError> {
        let address = (location.host.as_str(), location.port)
            .to_socket_addrs()
            .map_err(|err| KiraError::Ftp(format!("resolve {}: {err}", location.host)))?
            .next()
            .ok_or_else(|| KiraError::Ftp(format!("no address for {}", location.host)))?;
        let mut ftp = FtpStream::connect_timeout(address, self.timeout).map_err(ftp_error)?;
        ftp.login(location.user.as_str(), location.password.as_str())
            .map_err(ftp_error)?;
        ftp.transfer_type(FileType::Binary).map_err(ftp_error)?;
        ftp.set_mode(Mode::Passive);
        Ok(ftp)
    }
}

impl DownloadBackend for FtpDownloader {
    fn fetch(&self, request: &FetchRequest<'_>, progress: &dyn ProgressTracker) -> Result<u64, KiraError> {
        let location = FtpLocation::parse(request.url)?;
        debug!(host = %location.host, path = %location.path, head = ?request.head, "ftp download");
        let mut ftp = self.connect(&location)?;

        match ftp.size(&location.path) {
            Ok(size) => {
                let size = size as u64;
                progress.set_total(request.head.map_or(size, |head| head.min(size)));
            }
            Err(err) => debug!(error = %err, "ftp SIZE unsupported"),
        }

        let mut file = open_target(request.target, false)?;
        let mut stream = ftp.retr_as_stream(&location.path).map_err(ftp_error)?;
        let (written, cut_short) = receive(&mut stream, &mut file, request.head, progress)
            .map_err(|err| KiraError::Ftp(format!("{}: {err}", request.url)))?;

        if cut_short {
            // aborting mid-transfer leaves the control channel unusable
            drop(stream);
            if let Err(err) = ftp.quit() {
                debug!(error = %err, "ftp quit after head download");
            }
            return Ok(written);
        }

        ftp.finalize_retr_stream(stream).map_err(ftp_error)?;
        if let Err(err) = ftp.quit() {
            warn!(error = %err, "ftp quit failed");
        }
        Ok(written)
    }
}

/// Streams a RETR body into `file` and cuts the file at the bytes written.
/// Reports whether `head` stopped the transfer early.
fn receive<R: Read + ?Sized>(
    source: &mut R,
    file: &mut File,
    head: Option<u64>,
    progress: &dyn ProgressTracker,
) -> io::Result<(u64, bool)> {
    let written = copy_limited(source, file, head, progress)?;
    file.set_len(written)?;
    Ok((written, head.is_some_and(|head| written >= head)))
}

fn ftp_error(err: suppaftp::FtpError) -> KiraError {
    KiraError::Ftp(err.to_string())
}
