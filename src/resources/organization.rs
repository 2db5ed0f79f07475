use serde_json::{Value, json};

use crate::error::KiraError;
use crate::remote::{FieldSpec, RemoteObject, RemoteState, ResourceKind, blob_name, list_children};
use crate::resources::Project;
use crate::session::Session;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec::required("uuid"),
    FieldSpec::required("created_at"),
    FieldSpec::required("updated_at"),
    FieldSpec::required("name"),
];

/// Root of the ownership chain.
#[derive(Debug, Clone)]
pub struct Organization {
    state: RemoteState,
}

impl Organization {
    pub fn new(session: Session, name: impl Into<String>) -> Self {
        Self {
            state: RemoteState::new(session).with_field("name", json!(name.into())),
        }
    }

    pub fn name(&self) -> &str {
        self.state.field_str("name").unwrap_or_default()
    }

    pub fn project(&self, name: impl Into<String>) -> Project {
        Project::new(self.clone(), name)
    }

    /// Projects owned by this organization, already marked fetched.
    pub fn projects(&self) -> Result<impl Iterator<Item = Result<Project, KiraError>> + '_, KiraError> {
        let url = format!("sample_groups?organization_id={}", self.require_uuid()?);
        Ok(list_children(self.state.session(), url, self.inherited_url_options(), |blob| {
            Ok(self.project(blob_name(blob, "name")?))
        }))
    }
}

impl RemoteObject for Organization {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Organization
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
        format!("ORG{}", self.name())
    }

    fn nested_url(&self) -> String {
        format!("nested/{}", self.name())
    }

    fn fetch_parent(&mut self) -> Result<(), KiraError> {
        Ok(())
    }

    fn upsert_parent(&mut self) -> Result<(), KiraError> {
        Ok(())
    }

    fn create_request(&self) -> Result<(String, Value), KiraError> {
        Ok(("organizations".to_string(), json!({"name": self.name()})))
    }

    fn save_request(&self) -> Result<(String, Value), KiraError> {
        let url = format!("organizations/{}", self.require_uuid()?);
        Ok((url, Value::Object(self.remote_fields())))
    }

    fn delete_url(&self) -> Result<String, KiraError> {
        Ok(format!("organizations/{}", self.require_uuid()?))
    }
}
