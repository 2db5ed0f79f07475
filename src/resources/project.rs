use serde_json::{Value, json};
use tracing::debug;

use crate::error::KiraError;
use crate::remote::{
    FieldSpec, RemoteObject, RemoteState, ResourceKind, blob_name, list_children,
    without_null_uuid,
};
use crate::resources::{FolderParent, Organization, ResultFolder, Sample};
use crate::transport::UrlOptions;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec::required("uuid"),
    FieldSpec::required("created_at"),
    FieldSpec::required("name"),
    FieldSpec::required("description"),
    FieldSpec::optional("privacy_level"),
];

const MEMBERSHIP_BATCH: usize = 100;

/// A project (sample group) owned by an organization.
#[derive(Debug, Clone)]
pub struct Project {
    state: RemoteState,
    org: Organization,
    new_org: Option<Organization>,
    storage_provider: String,
    added_samples: Vec<String>,
    removed_samples: Vec<String>,
}

impl Project {
    pub fn new(org: Organization, name: impl Into<String>) -> Self {
        Self {
            state: RemoteState::new(org.session()).with_field("name", json!(name.into())),
            org,
            new_org: None,
            storage_provider: "default".to_string(),
            added_samples: Vec::new(),
            removed_samples: Vec::new(),
        }
    }

    pub fn with_privacy_level(mut self, level: impl Into<String>) -> Self {
        self.state.set("privacy_level", json!(level.into()));
        self
    }

    pub fn with_storage_provider(mut self, provider: impl Into<String>) -> Self {
        self.storage_provider = provider.into();
        self
    }

    pub fn name(&self) -> &str {
        self.state.field_str("name").unwrap_or_default()
    }

    pub fn organization(&self) -> &Organization {
        &self.org
    }

    pub fn description(&self) -> Option<&str> {
        self.state.field_str("description")
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Result<(), KiraError> {
        self.write_field("description", json!(description.into()))
    }

    /// Moves the project to another organization on the next save. The project
    /// keeps its identifier.
    pub fn change_organization(&mut self, org: Organization) -> Result<(), KiraError> {
        self.ensure_live()?;
        self.new_org = Some(org);
        self.state.mark_modified();
        Ok(())
    }

    /// Buffers membership for the next save; the server is not contacted here.
    pub fn add_sample(&mut self, sample: &Sample) -> Result<(), KiraError> {
        let uuid = sample.require_uuid()?;
        self.add_sample_uuids([uuid])
    }

    pub fn add_sample_uuids<I>(&mut self, uuids: I) -> Result<(), KiraError>
    where
        I: IntoIterator<Item = String>,
    {
        self.ensure_live()?;
        self.added_samples.extend(uuids);
        self.state.mark_modified();
        Ok(())
    }

    pub fn remove_sample(&mut self, sample: &Sample) -> Result<(), KiraError> {
        self.ensure_live()?;
        self.removed_samples.push(sample.require_uuid()?);
        self.state.mark_modified();
        Ok(())
    }

    pub fn sample(&self, name: impl Into<String>) -> Sample {
        Sample::new(self.clone(), name, json!({}))
    }

    pub fn sample_with_metadata(&self, name: impl Into<String>, metadata: Value) -> Sample {
        Sample::new(self.clone(), name, metadata)
    }

    pub fn result_folder(&self, module_name: impl Into<String>) -> ResultFolder {
        ResultFolder::new(FolderParent::Project(self.clone()), module_name, None)
    }

    pub fn samples(&self) -> Result<impl Iterator<Item = Result<Sample, KiraError>> + '_, KiraError> {
        let url = format!("sample_groups/{}/samples", self.require_uuid()?);
        Ok(list_children(self.state.session(), url, self.inherited_url_options(), |blob| {
            Ok(self.sample(blob_name(blob, "name")?))
        }))
    }

    pub fn result_folders(
        &self,
    ) -> Result<impl Iterator<Item = Result<ResultFolder, KiraError>> + '_, KiraError> {
        let url = format!("sample_group_ars?sample_group_id={}", self.require_uuid()?);
        Ok(list_children(self.state.session(), url, self.inherited_url_options(), |blob| {
            Ok(self.result_folder(blob_name(blob, "module_name")?))
        }))
    }

    fn post_data(&self) -> Result<Value, KiraError> {
        let mut data = without_null_uuid(self.remote_fields());
        let owner = self.new_org.as_ref().unwrap_or(&self.org);
        data.insert("organization".to_string(), json!(owner.require_uuid()?));
        let description = self.description().filter(|text| !text.is_empty());
        data.insert(
            "description".to_string(),
            json!(description.unwrap_or(self.name())),
        );
        let privacy = self
            .state
            .field_str("privacy_level")
            .filter(|level| !level.is_empty())
            .unwrap_or("private");
        data.insert("privacy_level".to_string(), json!(privacy));
        data.insert(
            "storage_provider_name".to_string(),
            json!(self.storage_provider),
        );
        Ok(Value::Object(data))
    }

    fn flush_membership(&mut self) -> Result<(), KiraError> {
        let url = format!("sample_groups/{}/samples", self.require_uuid()?);
        let session = self.session();
        for batch in self.added_samples.chunks(MEMBERSHIP_BATCH) {
            debug!(project = %self.name(), count = batch.len(), "adding samples");
            session
                .transport()
                .post(&url, &json!({"sample_uuids": batch}), &UrlOptions::new())?;
        }
        self.added_samples.clear();

        if !self.removed_samples.is_empty() {
            debug!(project = %self.name(), count = self.removed_samples.len(), "removing samples");
            session
                .transport()
                .delete(&url, Some(&json!({"sample_uuids": self.removed_samples})))?;
        }
        self.removed_samples.clear();
        Ok(())
    }
}

impl RemoteObject for Project {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Project
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
        format!("PROJ{}{}", self.name(), self.org.pre_hash())
    }

    fn nested_url(&self) -> String {
        format!("{}/sample_groups/{}", self.org.nested_url(), self.name())
    }

    fn fetch_parent(&mut self) -> Result<(), KiraError> {
        self.org.fetch()
    }

    fn upsert_parent(&mut self) -> Result<(), KiraError> {
        self.org.idempotent_upsert()
    }

    fn create_request(&self) -> Result<(String, Value), KiraError> {
        Ok(("sample_groups?format=json".to_string(), self.post_data()?))
    }

    fn save_request(&self) -> Result<(String, Value), KiraError> {
        let url = format!("sample_groups/{}", self.require_uuid()?);
        Ok((url, self.post_data()?))
    }

    fn delete_url(&self) -> Result<String, KiraError> {
        Ok(format!("sample_groups/{}", self.require_uuid()?))
    }

    fn after_save(&mut self) -> Result<(), KiraError> {
        self.flush_membership()?;
        if let Some(org) = self.new_org.take() {
            self.org = org;
        }
        Ok(())
    }

    fn inherited_url_options(&self) -> UrlOptions {
        let mut options = self.org.inherited_url_options();
        options.extend(self.state.url_options().clone());
        options
    }
}
