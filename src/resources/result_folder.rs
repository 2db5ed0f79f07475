use serde_json::{Map, Value, json};

use crate::error::KiraError;
use crate::remote::{
    FieldSpec, RemoteObject, RemoteState, ResourceKind, blob_name, list_children,
};
use crate::resources::{Project, ResultFile, Sample};
use crate::transport::UrlOptions;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec::required("uuid"),
    FieldSpec::required("created_at"),
    FieldSpec::required("updated_at"),
    FieldSpec::required("module_name"),
    FieldSpec::required("replicate"),
    FieldSpec::required("description"),
    FieldSpec::required("is_private"),
];

/// The owner of a result folder: either a sample or a whole project.
#[derive(Debug, Clone)]
pub enum FolderParent {
    Project(Project),
    Sample(Sample),
}

impl FolderParent {
    fn as_remote(&self) -> &dyn RemoteObject {
        match self {
            FolderParent::Project(project) => project,
            FolderParent::Sample(sample) => sample,
        }
    }

    fn as_remote_mut(&mut self) -> &mut dyn RemoteObject {
        match self {
            FolderParent::Project(project) => project,
            FolderParent::Sample(sample) => sample,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FolderParent::Project(project) => project.name(),
            FolderParent::Sample(sample) => sample.name(),
        }
    }

    /// Collection the folder lives in and the field naming its owner.
    fn collection(&self) -> (&'static str, &'static str) {
        match self {
            FolderParent::Project(_) => ("sample_group_ars", "sample_group"),
            FolderParent::Sample(_) => ("sample_ars", "sample"),
        }
    }

    fn file_collection(&self) -> &'static str {
        match self {
            FolderParent::Project(_) => "sample_group_ar_fields",
            FolderParent::Sample(_) => "sample_ar_fields",
        }
    }
}

/// A named group of result files produced by one analysis module.
#[derive(Debug, Clone)]
pub struct ResultFolder {
    state: RemoteState,
    parent: FolderParent,
}

impl ResultFolder {
    pub fn new(parent: FolderParent, module_name: impl Into<String>, replicate: Option<String>) -> Self {
        let state = RemoteState::new(parent.as_remote().session())
            .with_field("module_name", json!(module_name.into()))
            .with_field("replicate", json!(replicate));
        Self { state, parent }
    }

    pub fn module_name(&self) -> &str {
        self.state.field_str("module_name").unwrap_or_default()
    }

    pub fn replicate(&self) -> Option<&str> {
        self.state.field_str("replicate").filter(|text| !text.is_empty())
    }

    pub fn parent(&self) -> &FolderParent {
        &self.parent
    }

    pub fn is_sample_result(&self) -> bool {
        matches!(self.parent, FolderParent::Sample(_))
    }

    pub(crate) fn file_collection(&self) -> &'static str {
        self.parent.file_collection()
    }

    pub fn result_file(&self, name: impl Into<String>) -> ResultFile {
        ResultFile::new(self.clone(), name, Value::Object(Map::new()))
    }

    pub fn result_file_with_data(&self, name: impl Into<String>, stored_data: Value) -> ResultFile {
        ResultFile::new(self.clone(), name, stored_data)
    }

    pub fn result_files(
        &self,
    ) -> Result<impl Iterator<Item = Result<ResultFile, KiraError>> + '_, KiraError> {
        let url = format!(
            "{}?analysis_result_id={}",
            self.file_collection(),
            self.require_uuid()?
        );
        Ok(list_children(self.state.session(), url, self.inherited_url_options(), |blob| {
            Ok(self.result_file(blob_name(blob, "name")?))
        }))
    }

    /// Copies the folder and its files under `parent`, keeping module and replicate.
    pub fn copy_to(&self, parent: FolderParent, save: bool) -> Result<ResultFolder, KiraError> {
        let replicate = self.replicate().map(str::to_string);
        let mut copied = ResultFolder::new(parent, self.module_name(), replicate);
        if save {
            copied.idempotent_upsert()?;
        }
        for file in self.result_files()? {
            file?.copy_to(&copied, save)?;
        }
        Ok(copied)
    }

    fn post_data(&self) -> Result<Value, KiraError> {
        let (_, owner_field) = self.parent.collection();
        let mut data: Map<String, Value> = self
            .remote_fields()
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        data.insert(owner_field.to_string(), json!(self.parent.as_remote().require_uuid()?));
        if let Some(replicate) = self.replicate() {
            data.insert("replicate".to_string(), json!(replicate));
        }
        Ok(Value::Object(data))
    }
}

impl RemoteObject for ResultFolder {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ResultFolder
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
        match self.replicate() {
            Some(replicate) => format!("{} ({replicate})", self.module_name()),
            None => self.module_name().to_string(),
        }
    }

    fn pre_hash(&self) -> String {
        format!(
            "FOLDER{}{}{}",
            self.module_name(),
            self.parent.as_remote().pre_hash(),
            self.replicate().unwrap_or_default()
        )
    }

    fn nested_url(&self) -> String {
        format!(
            "{}/analysis_results/{}",
            self.parent.as_remote().nested_url(),
            self.module_name()
        )
    }

    fn fetch_url(&self) -> String {
        match self.replicate() {
            Some(replicate) => format!("{}?replicate={replicate}", self.nested_url()),
            None => self.nested_url(),
        }
    }

    fn fetch_parent(&mut self) -> Result<(), KiraError> {
        self.parent.as_remote_mut().fetch()
    }

    fn upsert_parent(&mut self) -> Result<(), KiraError> {
        self.parent.as_remote_mut().idempotent_upsert()
    }

    fn create_request(&self) -> Result<(String, Value), KiraError> {
        let (collection, _) = self.parent.collection();
        Ok((format!("{collection}?format=json"), self.post_data()?))
    }

    fn save_request(&self) -> Result<(String, Value), KiraError> {
        let (collection, _) = self.parent.collection();
        let url = format!("{collection}/{}", self.require_uuid()?);
        Ok((url, self.post_data()?))
    }

    fn delete_url(&self) -> Result<String, KiraError> {
        let (collection, _) = self.parent.collection();
        Ok(format!("{collection}/{}", self.require_uuid()?))
    }

    fn inherited_url_options(&self) -> UrlOptions {
        let mut options = self.parent.as_remote().inherited_url_options();
        options.extend(self.state.url_options().clone());
        options
    }
}
