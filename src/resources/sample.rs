use serde_json::{Value, json};

use crate::error::KiraError;
use crate::remote::{
    FieldSpec, RemoteObject, RemoteState, ResourceKind, blob_name, list_children,
    without_null_uuid,
};
use crate::resources::{FolderParent, Project, ResultFolder};
use crate::transport::UrlOptions;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec::required("uuid"),
    FieldSpec::required("created_at"),
    FieldSpec::required("updated_at"),
    FieldSpec::required("name"),
    FieldSpec::required("metadata"),
    FieldSpec::required("library"),
    FieldSpec::required("description"),
];

/// A biological sample inside a project.
#[derive(Debug, Clone)]
pub struct Sample {
    state: RemoteState,
    project: Project,
    new_project: Option<Project>,
}

impl Sample {
    pub fn new(project: Project, name: impl Into<String>, metadata: Value) -> Self {
        let state = RemoteState::new(project.session())
            .with_field("name", json!(name.into()))
            .with_field("metadata", metadata);
        Self {
            state,
            project,
            new_project: None,
        }
    }

    pub fn name(&self) -> &str {
        self.state.field_str("name").unwrap_or_default()
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn metadata(&self) -> &Value {
        self.state.field("metadata")
    }

    pub fn set_metadata(&mut self, metadata: Value) -> Result<(), KiraError> {
        self.write_field("metadata", metadata)
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Result<(), KiraError> {
        self.write_field("description", json!(description.into()))
    }

    /// Moves the sample to another project on the next save.
    pub fn change_project(&mut self, project: Project) -> Result<(), KiraError> {
        self.ensure_live()?;
        self.new_project = Some(project);
        self.state.mark_modified();
        Ok(())
    }

    pub fn result_folder(&self, module_name: impl Into<String>) -> ResultFolder {
        ResultFolder::new(FolderParent::Sample(self.clone()), module_name, None)
    }

    pub fn result_folder_replicate(
        &self,
        module_name: impl Into<String>,
        replicate: impl Into<String>,
    ) -> ResultFolder {
        ResultFolder::new(
            FolderParent::Sample(self.clone()),
            module_name,
            Some(replicate.into()),
        )
    }

    pub fn result_folders(
        &self,
    ) -> Result<impl Iterator<Item = Result<ResultFolder, KiraError>> + '_, KiraError> {
        let url = format!("sample_ars?sample_id={}", self.require_uuid()?);
        Ok(list_children(self.state.session(), url, self.inherited_url_options(), |blob| {
            let replicate = blob.get("replicate").and_then(Value::as_str).map(str::to_string);
            Ok(ResultFolder::new(
                FolderParent::Sample(self.clone()),
                blob_name(blob, "module_name")?,
                replicate,
            ))
        }))
    }

    /// Copies the sample, its result folders and their files into `project`.
    /// With `save`, each copy is upserted before its children are copied.
    pub fn copy_to(&self, project: &Project, save: bool) -> Result<Sample, KiraError> {
        let mut copied = project.sample_with_metadata(self.name(), self.metadata().clone());
        if save {
            copied.idempotent_upsert()?;
        }
        for folder in self.result_folders()? {
            folder?.copy_to(FolderParent::Sample(copied.clone()), save)?;
        }
        Ok(copied)
    }

    fn post_data(&self) -> Result<Value, KiraError> {
        let mut data = without_null_uuid(self.remote_fields());
        let owner = self.new_project.as_ref().unwrap_or(&self.project);
        data.insert("library".to_string(), json!(owner.require_uuid()?));
        if data.get("description").is_some_and(Value::is_null) {
            data.remove("description");
        }
        Ok(Value::Object(data))
    }
}

impl RemoteObject for Sample {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Sample
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
        format!("SAMPLE{}{}", self.name(), self.project.pre_hash())
    }

    fn nested_url(&self) -> String {
        format!("{}/samples/{}", self.project.nested_url(), self.name())
    }

    fn fetch_parent(&mut self) -> Result<(), KiraError> {
        self.project.fetch()
    }

    fn upsert_parent(&mut self) -> Result<(), KiraError> {
        self.project.idempotent_upsert()
    }

    fn create_request(&self) -> Result<(String, Value), KiraError> {
        Ok(("samples".to_string(), self.post_data()?))
    }

    fn save_request(&self) -> Result<(String, Value), KiraError> {
        let url = format!("samples/{}", self.require_uuid()?);
        Ok((url, self.post_data()?))
    }

    fn delete_url(&self) -> Result<String, KiraError> {
        Ok(format!("samples/{}", self.require_uuid()?))
    }

    fn after_save(&mut self) -> Result<(), KiraError> {
        if let Some(project) = self.new_project.take() {
            self.project = project;
        }
        Ok(())
    }

    fn inherited_url_options(&self) -> UrlOptions {
        let mut options = self.project.inherited_url_options();
        options.extend(self.state.url_options().clone());
        options
    }
}
