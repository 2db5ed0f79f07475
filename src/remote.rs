use std::fmt;

use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::CacheKey;
use crate::error::KiraError;
use crate::session::Session;
use crate::transport::{Paginator, UrlOptions};

/// One declared remote field and whether a server blob must carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Organization,
    Project,
    Sample,
    ResultFolder,
    ResultFile,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Organization => "organization",
            ResourceKind::Project => "project",
            ResourceKind::Sample => "sample",
            ResourceKind::ResultFolder => "result folder",
            ResourceKind::ResultFile => "result file",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an existence check; absence is an ordinary answer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found,
    Absent,
}

static NULL: Value = Value::Null;

/// Field values and lifecycle flags shared by every resource kind.
#[derive(Debug, Clone)]
pub struct RemoteState {
    session: Session,
    fields: Map<String, Value>,
    url_options: UrlOptions,
    fetched: bool,
    modified: bool,
    deleted: bool,
}

impl RemoteState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            fields: Map::new(),
            url_options: UrlOptions::new(),
            fetched: false,
            modified: false,
            deleted: false,
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Absent fields read as `null`.
    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).as_str()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.field_str("uuid")
    }

    pub fn url_options(&self) -> &UrlOptions {
        &self.url_options
    }

    pub fn url_options_mut(&mut self) -> &mut UrlOptions {
        &mut self.url_options
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
        self.modified = true;
    }

    pub(crate) fn mark_modified(&mut self) {
        self.modified = true;
    }

    pub(crate) fn mark_fetched(&mut self) {
        self.fetched = true;
        self.modified = false;
    }

    /// Forces the next fetch back to the server.
    pub(crate) fn mark_stale(&mut self) {
        self.fetched = false;
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
        self.fetched = false;
    }

    pub fn remote_fields(&self, schema: &[FieldSpec]) -> Map<String, Value> {
        schema
            .iter()
            .map(|spec| (spec.name.to_string(), self.field(spec.name).clone()))
            .collect()
    }

    /// Merges a server blob into the declared fields.
    ///
    /// Validates every field before touching any, so a conflict leaves local
    /// state unchanged.
    pub(crate) fn load(
        &mut self,
        schema: &[FieldSpec],
        blob: &Value,
        allow_overwrite: bool,
    ) -> Result<(), KiraError> {
        let object = blob
            .as_object()
            .ok_or_else(|| KiraError::Decode(format!("expected a JSON object, got {blob}")))?;

        let mut incoming = Vec::with_capacity(schema.len());
        for spec in schema {
            let new = match object.get(spec.name) {
                Some(value) => value.clone(),
                None if spec.required => {
                    return Err(KiraError::MissingField {
                        field: spec.name.to_string(),
                    });
                }
                None => Value::Null,
            };
            if !allow_overwrite {
                let current = self.field(spec.name);
                if is_overwrite(current, &new) {
                    return Err(KiraError::OverwriteConflict {
                        field: spec.name.to_string(),
                        current: current.to_string(),
                        new: new.to_string(),
                    });
                }
            }
            incoming.push((spec.name, new));
        }

        for (name, value) in incoming {
            self.fields.insert(name.to_string(), value);
        }
        Ok(())
    }
}

/// True when replacing `current` with `new` would discard a local value.
///
/// Falsy values (null, `false`, zero, empty) carry nothing to lose. A map may
/// be replaced by a map that keeps every existing key at its existing value.
pub fn is_overwrite(current: &Value, new: &Value) -> bool {
    if is_unset(current) || current == new {
        return false;
    }
    match (current, new) {
        (Value::Object(current), Value::Object(new)) => !current
            .iter()
            .all(|(key, value)| new.get(key) == Some(value)),
        _ => true,
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
    }
}

/// Drops a `null` uuid so create payloads never send one.
pub(crate) fn without_null_uuid(mut data: Map<String, Value>) -> Map<String, Value> {
    if data.get("uuid").is_some_and(Value::is_null) {
        data.remove("uuid");
    }
    data
}

/// Lifecycle protocol for a server-backed resource.
///
/// Implementors describe their path, payload shapes and parent chain; the
/// provided methods implement fetch/create/save/delete, caching, and conflict
/// detection uniformly. An instance is not meant to be shared across threads:
/// give each worker its own.
pub trait RemoteObject {
    fn kind(&self) -> ResourceKind;
    fn schema(&self) -> &'static [FieldSpec];
    fn state(&self) -> &RemoteState;
    fn state_mut(&mut self) -> &mut RemoteState;
    fn display_name(&self) -> String;

    /// Deterministic identity string covering kind, key attributes and ancestry.
    fn pre_hash(&self) -> String;
    fn nested_url(&self) -> String;

    fn fetch_url(&self) -> String {
        self.nested_url()
    }

    /// Brings the parent to a fetched state.
    fn fetch_parent(&mut self) -> Result<(), KiraError>;

    /// Brings the parent to a fetched-or-created state.
    fn upsert_parent(&mut self) -> Result<(), KiraError>;

    fn create_request(&self) -> Result<(String, Value), KiraError>;
    fn save_request(&self) -> Result<(String, Value), KiraError>;
    fn delete_url(&self) -> Result<String, KiraError>;

    fn after_save(&mut self) -> Result<(), KiraError> {
        Ok(())
    }

    fn cacheable(&self) -> bool {
        true
    }

    fn inherited_url_options(&self) -> UrlOptions {
        self.state().url_options().clone()
    }

    fn uuid(&self) -> Option<&str> {
        self.state().uuid()
    }

    fn require_uuid(&self) -> Result<String, KiraError> {
        self.uuid()
            .map(str::to_string)
            .ok_or_else(|| KiraError::MissingIdentifier {
                kind: self.kind().as_str(),
                name: self.display_name(),
            })
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::from_pre_hash(&self.pre_hash())
    }

    fn session(&self) -> Session {
        self.state().session().clone()
    }

    fn is_fetched(&self) -> bool {
        self.state().is_fetched()
    }

    fn is_modified(&self) -> bool {
        self.state().is_modified()
    }

    fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    fn ensure_live(&self) -> Result<(), KiraError> {
        if self.state().is_deleted() {
            return Err(KiraError::Deleted {
                kind: self.kind().as_str(),
                name: self.display_name(),
            });
        }
        Ok(())
    }

    fn write_field(&mut self, name: &str, value: Value) -> Result<(), KiraError> {
        self.ensure_live()?;
        debug!(kind = %self.kind(), field = name, "setting remote field");
        self.state_mut().set(name, value);
        Ok(())
    }

    fn remote_fields(&self) -> Map<String, Value> {
        self.state().remote_fields(self.schema())
    }

    fn load(&mut self, blob: &Value, allow_overwrite: bool) -> Result<(), KiraError> {
        self.ensure_live()?;
        let schema = self.schema();
        self.state_mut().load(schema, blob, allow_overwrite)
    }

    fn invalidate_cache(&self) -> Result<(), KiraError> {
        self.state().session().cache().invalidate(&self.cache_key())
    }

    fn fetch(&mut self) -> Result<(), KiraError> {
        self.fetch_with(false)
    }

    fn fetch_with(&mut self, allow_overwrite: bool) -> Result<(), KiraError> {
        self.ensure_live()?;
        if self.is_fetched() {
            debug!(kind = %self.kind(), name = %self.display_name(), "already fetched");
            return Ok(());
        }
        self.fetch_parent()?;

        let session = self.session();
        let key = self.cache_key();
        let cached = if self.cacheable() {
            session.cache().get(&key)?
        } else {
            None
        };

        match cached {
            Some(blob) => self.load(&blob, allow_overwrite)?,
            None => {
                debug!(kind = %self.kind(), name = %self.display_name(), "fetching");
                let blob = session
                    .transport()
                    .get(&self.fetch_url(), &self.inherited_url_options())?;
                self.load(&blob, allow_overwrite)?;
                if self.cacheable() {
                    session.cache().put(&key, &blob)?;
                }
            }
        }
        self.state_mut().mark_fetched();
        Ok(())
    }

    fn try_fetch(&mut self) -> Result<Lookup, KiraError> {
        match self.fetch() {
            Ok(()) => Ok(Lookup::Found),
            Err(err) if err.is_not_found() => Ok(Lookup::Absent),
            Err(err) => Err(err),
        }
    }

    fn exists(&mut self) -> Result<bool, KiraError> {
        Ok(self.try_fetch()? == Lookup::Found)
    }

    fn create(&mut self) -> Result<(), KiraError> {
        self.ensure_live()?;
        if self.is_fetched() {
            debug!(kind = %self.kind(), name = %self.display_name(), "already fetched, not creating");
            return Ok(());
        }
        self.upsert_parent()?;
        self.invalidate_cache()?;

        debug!(kind = %self.kind(), name = %self.display_name(), "creating");
        let (url, body) = self.create_request()?;
        let session = self.session();
        let blob = session
            .transport()
            .post(&url, &body, &self.inherited_url_options())?;
        // the server's representation of what it just created is authoritative
        self.load(&blob, true)?;
        self.state_mut().mark_fetched();
        Ok(())
    }

    fn save(&mut self) -> Result<(), KiraError> {
        self.ensure_live()?;
        if !self.is_fetched() {
            return Err(KiraError::NotFetched {
                kind: self.kind().as_str(),
                name: self.display_name(),
            });
        }
        if !self.is_modified() {
            debug!(kind = %self.kind(), name = %self.display_name(), "not modified, nothing to save");
            return Ok(());
        }
        self.invalidate_cache()?;

        debug!(kind = %self.kind(), name = %self.display_name(), "saving");
        let (url, body) = self.save_request()?;
        let session = self.session();
        session
            .transport()
            .put(&url, &body, &self.inherited_url_options())?;
        self.after_save()?;
        self.state_mut().mark_fetched();
        Ok(())
    }

    /// Fetch-or-create when not yet fetched, otherwise save.
    fn idempotent_upsert(&mut self) -> Result<(), KiraError> {
        self.ensure_live()?;
        if self.is_fetched() {
            return self.save();
        }
        match self.try_fetch()? {
            Lookup::Found => Ok(()),
            Lookup::Absent => self.create(),
        }
    }

    fn delete(&mut self) -> Result<(), KiraError> {
        self.ensure_live()?;
        debug!(kind = %self.kind(), name = %self.display_name(), "deleting");
        let url = self.delete_url()?;
        self.session().transport().delete(&url, None)?;
        self.invalidate_cache()?;
        self.state_mut().mark_deleted();
        Ok(())
    }
}

/// Walks a paginated listing and turns each blob into a fetched child.
/// `options` are the owner's inherited URL options.
pub(crate) fn list_children<'a, T, F>(
    session: &'a Session,
    url: String,
    options: UrlOptions,
    mut build: F,
) -> impl Iterator<Item = Result<T, KiraError>> + 'a
where
    T: RemoteObject + 'a,
    F: FnMut(&Value) -> Result<T, KiraError> + 'a,
{
    Paginator::new(session.transport(), url, options).map(move |blob| {
        let blob = blob?;
        let mut child = build(&blob)?;
        child.load(&blob, true)?;
        child.state_mut().mark_fetched();
        if child.cacheable() {
            session.cache().put(&child.cache_key(), &blob)?;
        }
        Ok(child)
    })
}

pub(crate) fn blob_name(blob: &Value, key: &str) -> Result<String, KiraError> {
    blob.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| KiraError::MissingField {
            field: key.to_string(),
        })
}
