use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde_json::Map;
use tracing::{info, warn};

use crate::download::FileDownloader;
use crate::error::KiraError;
use crate::progress::ProgressFactory;
use crate::remote::RemoteObject;
use crate::resources::{DownloadOptions, ResultFile};
use crate::upload::{MultipartUploader, PartUploader, TransferConfig, UploadReceipt};

/// One unit of work for the batch runner. Each request owns its result file,
/// so no two workers ever share a resource instance.
#[derive(Debug)]
pub enum TransferRequest {
    Upload { file: ResultFile, source: PathBuf },
    Download { file: ResultFile, options: DownloadOptions },
}

impl TransferRequest {
    pub fn label(&self) -> String {
        match self {
            TransferRequest::Upload { source, .. } => source.display().to_string(),
            TransferRequest::Download { file, .. } => file.local_filename(),
        }
    }

    fn into_file(self) -> ResultFile {
        match self {
            TransferRequest::Upload { file, .. } | TransferRequest::Download { file, .. } => file,
        }
    }
}

#[derive(Debug)]
pub enum TransferStatus {
    Uploaded(UploadReceipt),
    Downloaded(PathBuf),
    /// Cancelled before a worker picked it up.
    Skipped,
}

/// Result of one request, returned with its file so temporary downloads
/// stay on disk for as long as the caller holds it.
#[derive(Debug)]
pub struct TransferOutcome {
    pub label: String,
    pub file: ResultFile,
    pub result: Result<TransferStatus, KiraError>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.result,
            Ok(TransferStatus::Uploaded(_) | TransferStatus::Downloaded(_))
        )
    }
}

/// Stops a batch from starting new work; transfers already running finish.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs independent transfers on a bounded worker pool.
pub struct BatchRunner<'a> {
    workers: usize,
    transfer: TransferConfig,
    parts: &'a dyn PartUploader,
    downloader: &'a FileDownloader,
    progress: &'a dyn ProgressFactory,
    cancel: CancelHandle,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        workers: usize,
        transfer: TransferConfig,
        parts: &'a dyn PartUploader,
        downloader: &'a FileDownloader,
        progress: &'a dyn ProgressFactory,
    ) -> Self {
        Self {
            workers: workers.max(1),
            transfer,
            parts,
            downloader,
            progress,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Outcomes come back in submission order.
    pub fn run(&self, requests: Vec<TransferRequest>) -> Result<Vec<TransferOutcome>, KiraError> {
        info!(requests = requests.len(), workers = self.workers, "starting batch");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|err| KiraError::InvalidConfig(format!("worker pool: {err}")))?;
        let outcomes: Vec<TransferOutcome> =
            pool.install(|| requests.into_par_iter().map(|request| self.run_one(request)).collect());

        let failed = outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .count();
        if failed > 0 {
            warn!(failed, total = outcomes.len(), "batch finished with failures");
        } else {
            info!(total = outcomes.len(), "batch finished");
        }
        Ok(outcomes)
    }

    fn run_one(&self, request: TransferRequest) -> TransferOutcome {
        let label = request.label();
        if self.cancel.is_cancelled() {
            return TransferOutcome {
                label,
                file: request.into_file(),
                result: Ok(TransferStatus::Skipped),
            };
        }

        let tracker = self.progress.tracker(&label);
        let (file, result) = match request {
            TransferRequest::Upload { mut file, source } => {
                let session = file.session();
                let uploader = MultipartUploader::new(session.transport(), self.parts, self.transfer);
                let result = file
                    .upload_file(&uploader, &source, Map::new(), tracker.as_ref())
                    .map(TransferStatus::Uploaded);
                (file, result)
            }
            TransferRequest::Download { mut file, options } => {
                let result = file
                    .download(self.downloader, &options, tracker.as_ref())
                    .map(TransferStatus::Downloaded);
                (file, result)
            }
        };
        if let Err(err) = &result {
            warn!(label = %label, error = %err, "transfer failed");
        }
        TransferOutcome {
            label,
            file,
            result,
        }
    }
}
