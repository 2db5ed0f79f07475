use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tracing::debug;

use crate::download::FileDownloader;
use crate::error::KiraError;
use crate::progress::ProgressTracker;
use crate::remote::{FieldSpec, RemoteObject, RemoteState, ResourceKind};
use crate::resources::ResultFolder;
use crate::storage::{StoragePointer, check_json_round_trip};
use crate::transport::UrlOptions;
use crate::upload::{MultipartUploader, ResultType, UploadReceipt, UploadTarget};

const SCHEMA: &[FieldSpec] = &[
    FieldSpec::required("uuid"),
    FieldSpec::required("created_at"),
    FieldSpec::required("updated_at"),
    FieldSpec::required("name"),
    FieldSpec::required("stored_data"),
    FieldSpec::optional("pipeline_run"),
];

/// How `ResultFile::download` picks and reuses its local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Destination; `None` downloads into a private temporary directory that
    /// lives as long as the result file.
    pub target: Option<PathBuf>,
    pub use_cache: bool,
    pub head: Option<u64>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            target: None,
            use_cache: true,
            head: None,
        }
    }
}

/// One named file inside a result folder. Its `stored_data` is either an
/// inline JSON blob or a pointer to remote storage.
#[derive(Debug, Clone)]
pub struct ResultFile {
    state: RemoteState,
    folder: ResultFolder,
    local_copy: Option<PathBuf>,
    scratch: Option<Arc<TempDir>>,
}

impl ResultFile {
    pub fn new(folder: ResultFolder, name: impl Into<String>, stored_data: Value) -> Self {
        let state = RemoteState::new(folder.session())
            .with_field("name", json!(name.into()))
            .with_field("stored_data", stored_data);
        Self {
            state,
            folder,
            local_copy: None,
            scratch: None,
        }
    }

    pub fn name(&self) -> &str {
        self.state.field_str("name").unwrap_or_default()
    }

    pub fn folder(&self) -> &ResultFolder {
        &self.folder
    }

    pub fn stored_data(&self) -> &Value {
        self.state.field("stored_data")
    }

    pub fn set_stored_data(&mut self, stored_data: Value) -> Result<(), KiraError> {
        self.write_field("stored_data", stored_data)
    }

    pub fn set_pipeline_run(&mut self, pipeline_run: impl Into<String>) -> Result<(), KiraError> {
        self.write_field("pipeline_run", json!(pipeline_run.into()))
    }

    /// `None` for inline blobs.
    pub fn pointer(&self) -> Result<Option<StoragePointer>, KiraError> {
        StoragePointer::from_stored_data(self.stored_data())
    }

    /// Path of the last full download made through this handle.
    pub fn local_copy(&self) -> Option<&Path> {
        self.local_copy.as_deref()
    }

    pub fn link_s3(&mut self, url: &str, endpoint_url: Option<&str>) -> Result<(), KiraError> {
        self.link(StoragePointer::s3(url, endpoint_url)?)
    }

    pub fn link_ftp(&mut self, url: &str) -> Result<(), KiraError> {
        self.link(StoragePointer::Ftp { url: url.to_string() })
    }

    pub fn link_sra(&mut self, url: &str) -> Result<(), KiraError> {
        self.link(StoragePointer::Sra { url: url.to_string() })
    }

    pub fn link_azure(&mut self, url: &str) -> Result<(), KiraError> {
        self.link(StoragePointer::azure(url)?)
    }

    fn link(&mut self, pointer: StoragePointer) -> Result<(), KiraError> {
        self.set_stored_data(pointer.to_stored_data())?;
        self.save()
    }

    pub fn download_url(&self) -> Result<String, KiraError> {
        self.pointer()?
            .ok_or(KiraError::UnsupportedStorage)?
            .download_url()
    }

    /// `<owner>.<module>.<name>.<ext>` with dots in each part replaced by `-`.
    pub fn local_filename(&self) -> String {
        let clean = |part: &str| part.replace('.', "-");
        let ext = referenced_extension(self.stored_data()).unwrap_or_else(|| "json".to_string());
        format!(
            "{}.{}.{}.{ext}",
            clean(self.folder.parent().name()),
            clean(self.folder.module_name()),
            clean(self.name())
        )
        .replace("::", "__")
    }

    /// Creates the file record if needed, then streams `path` through a
    /// multipart upload session. The stored data is re-read on the next fetch.
    pub fn upload_file(
        &mut self,
        uploader: &MultipartUploader<'_>,
        path: &Path,
        optional_fields: Map<String, Value>,
        progress: &dyn ProgressTracker,
    ) -> Result<UploadReceipt, KiraError> {
        self.idempotent_upsert()?;
        let target = UploadTarget {
            field_uuid: self.require_uuid()?,
            result_type: if self.folder.is_sample_result() {
                ResultType::Sample
            } else {
                ResultType::Group
            },
        };
        let receipt = uploader.upload(&target, path, optional_fields, progress)?;
        self.state.mark_stale();
        self.local_copy = None;
        Ok(receipt)
    }

    /// Uploads `data` as a `.json` file.
    pub fn upload_json(
        &mut self,
        uploader: &MultipartUploader<'_>,
        data: &Value,
        progress: &dyn ProgressTracker,
    ) -> Result<UploadReceipt, KiraError> {
        let mut file = tempfile::Builder::new()
            .prefix("kira-sync-")
            .suffix(".json")
            .tempfile()
            .map_err(KiraError::filesystem)?;
        serde_json::to_writer(&mut file, data).map_err(|err| KiraError::Decode(err.to_string()))?;
        file.flush().map_err(KiraError::filesystem)?;
        self.upload_file(uploader, file.path(), Map::new(), progress)
    }

    pub fn download(
        &mut self,
        downloader: &FileDownloader,
        options: &DownloadOptions,
        progress: &dyn ProgressTracker,
    ) -> Result<PathBuf, KiraError> {
        if !self.is_fetched() {
            self.fetch_with(true)?;
        }
        if options.use_cache && options.head.is_none() && options.target.is_none() {
            if let Some(path) = self.local_copy.as_ref().filter(|path| path.exists()) {
                debug!(file = %self.name(), path = %path.display(), "reusing local copy");
                return Ok(path.clone());
            }
        }

        let pointer = self.pointer()?.ok_or(KiraError::UnsupportedStorage)?;
        let target = match &options.target {
            Some(target) => target.clone(),
            None => self.scratch_dir()?.join(self.local_filename()),
        };
        let path = downloader.download(&pointer, &target, options.head, options.use_cache, progress)?;
        if options.head.is_none() {
            self.local_copy = Some(path.clone());
        }
        Ok(path)
    }

    /// Points a new file in `folder` at the same stored data; bytes are not moved.
    pub fn copy_to(&self, folder: &ResultFolder, save: bool) -> Result<ResultFile, KiraError> {
        let mut copied = folder.result_file_with_data(self.name(), self.stored_data().clone());
        if save {
            copied.idempotent_upsert()?;
        }
        Ok(copied)
    }

    fn scratch_dir(&mut self) -> Result<PathBuf, KiraError> {
        if let Some(dir) = &self.scratch {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix("kira-sync-")
            .tempdir()
            .map_err(KiraError::filesystem)?;
        let path = dir.path().to_path_buf();
        self.scratch = Some(Arc::new(dir));
        Ok(path)
    }

    fn post_data(&self) -> Result<Value, KiraError> {
        Ok(json!({
            "analysis_result": self.folder.require_uuid()?,
            "name": self.name(),
            "stored_data": self.stored_data(),
            "pipeline_run": self.state.field("pipeline_run"),
        }))
    }
}

/// Extension of the referenced file, keeping `.gz` as a double extension.
fn referenced_extension(stored_data: &Value) -> Option<String> {
    let location = ["filename", "uri", "url"]
        .iter()
        .find_map(|key| stored_data.get(*key).and_then(Value::as_str))?;
    let mut parts = location.rsplit('.');
    let ext = parts.next().filter(|ext| !ext.contains('/'))?;
    if ext == "gz" {
        if let Some(inner) = parts.next() {
            return Some(format!("{inner}.{ext}"));
        }
    }
    Some(ext.to_string())
}

impl RemoteObject for ResultFile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ResultFile
    }

    fn schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn state(&self) -> &RemoteState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RemoteState {
        &mut self.state
    }

    fn display_name(&self) -> String {
        self.name().to_string()
    }

    fn pre_hash(&self) -> String {
        format!("FILE{}{}", self.name(), self.folder.pre_hash())
    }

    fn nested_url(&self) -> String {
        format!("{}/fields/{}", self.folder.nested_url(), self.name())
    }

    fn fetch_parent(&mut self) -> Result<(), KiraError> {
        self.folder.fetch()
    }

    fn upsert_parent(&mut self) -> Result<(), KiraError> {
        self.folder.idempotent_upsert()
    }

    fn create_request(&self) -> Result<(String, Value), KiraError> {
        check_json_round_trip(self.stored_data())?;
        let url = format!("{}?format=json", self.folder.file_collection());
        Ok((url, self.post_data()?))
    }

    fn save_request(&self) -> Result<(String, Value), KiraError> {
        check_json_round_trip(self.stored_data())?;
        let url = format!("{}/{}", self.folder.file_collection(), self.require_uuid()?);
        Ok((url, self.post_data()?))
    }

    fn delete_url(&self) -> Result<String, KiraError> {
        Ok(format!("{}/{}", self.folder.file_collection(), self.require_uuid()?))
    }

    /// Stored data may hold presigned URLs that expire long before a cache entry.
    fn cacheable(&self) -> bool {
        false
    }

    fn inherited_url_options(&self) -> UrlOptions {
        let mut options = self.folder.inherited_url_options();
        options.extend(self.state.url_options().clone());
        options
    }
}
