use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::KiraError;

static HTTPS_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https://[^/]+)/(.+)$").expect("static regex")
});

/// Where a result file's bytes live when they are not inlined in `stored_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoragePointer {
    S3 {
        uri: String,
        endpoint_url: Option<String>,
        presigned_url: Option<String>,
    },
    Azure {
        uri: String,
        endpoint_url: Option<String>,
        presigned_url: Option<String>,
    },
    Ftp {
        url: String,
    },
    Sra {
        url: String,
    },
}

/// Which download backend can read a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    RangedHttp,
    Ftp,
    GenericHttp,
}

impl StoragePointer {
    /// `Ok(None)` means the stored data is an inline blob.
    pub fn from_stored_data(data: &Value) -> Result<Option<Self>, KiraError> {
        let Some(object) = data.as_object() else {
            return Ok(None);
        };
        let kind = object
            .get("__type__")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        let pointer = match kind.as_str() {
            "s3" => StoragePointer::S3 {
                uri: first_key(object, &["uri", "url"])?,
                endpoint_url: optional_key(object, "endpoint_url"),
                presigned_url: optional_key(object, "presigned_url"),
            },
            "azure" => StoragePointer::Azure {
                uri: first_key(object, &["uri", "url"])?,
                endpoint_url: optional_key(object, "endpoint_url"),
                presigned_url: optional_key(object, "presigned_url"),
            },
            "ftp" => StoragePointer::Ftp {
                url: first_key(object, &["url", "uri"])?,
            },
            "sra" => StoragePointer::Sra {
                url: first_key(object, &["url", "uri"])?,
            },
            _ => return Ok(None),
        };
        Ok(Some(pointer))
    }

    pub fn to_stored_data(&self) -> Value {
        match self {
            StoragePointer::S3 {
                uri,
                endpoint_url,
                presigned_url,
            } => cloud_blob("s3", uri, endpoint_url, presigned_url),
            StoragePointer::Azure {
                uri,
                endpoint_url,
                presigned_url,
            } => cloud_blob("azure", uri, endpoint_url, presigned_url),
            StoragePointer::Ftp { url } => json!({"__type__": "ftp", "uri": url}),
            StoragePointer::Sra { url } => json!({"__type__": "sra", "uri": url}),
        }
    }

    /// Splits `https://host/bucket/key` into an `s3://bucket/key` URI and its
    /// endpoint when no endpoint is given.
    pub fn s3(url: &str, endpoint_url: Option<&str>) -> Result<Self, KiraError> {
        if let Some(endpoint) = endpoint_url {
            return Ok(StoragePointer::S3 {
                uri: url.to_string(),
                endpoint_url: Some(endpoint.trim_end_matches('/').to_string()),
                presigned_url: None,
            });
        }
        let captures = HTTPS_HOST.captures(url).ok_or_else(|| {
            KiraError::InvalidStoragePointer(format!(
                "an endpoint is required for non-HTTPS S3 URL {url}"
            ))
        })?;
        Ok(StoragePointer::S3 {
            uri: format!("s3://{}", &captures[2]),
            endpoint_url: Some(captures[1].to_string()),
            presigned_url: None,
        })
    }

    pub fn azure(url: &str) -> Result<Self, KiraError> {
        let captures = HTTPS_HOST.captures(url).ok_or_else(|| {
            KiraError::InvalidStoragePointer(format!("Azure URL must be HTTPS: {url}"))
        })?;
        Ok(StoragePointer::Azure {
            uri: url.to_string(),
            endpoint_url: Some(captures[1].to_string()),
            presigned_url: None,
        })
    }

    /// A URL that can be fetched directly.
    pub fn download_url(&self) -> Result<String, KiraError> {
        match self {
            StoragePointer::S3 {
                uri,
                endpoint_url,
                presigned_url,
            } => {
                if let Some(presigned) = presigned_url {
                    return Ok(presigned.clone());
                }
                match uri.strip_prefix("s3://") {
                    Some(path) => {
                        let endpoint = endpoint_url.as_deref().ok_or_else(|| {
                            KiraError::InvalidStoragePointer(format!(
                                "{uri} has no endpoint_url to resolve against"
                            ))
                        })?;
                        Ok(format!("{}/{}", endpoint.trim_end_matches('/'), path))
                    }
                    None => Ok(uri.clone()),
                }
            }
            StoragePointer::Azure {
                uri, presigned_url, ..
            } => Ok(presigned_url.clone().unwrap_or_else(|| uri.clone())),
            StoragePointer::Ftp { url } | StoragePointer::Sra { url } => Ok(url.clone()),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            StoragePointer::S3 { .. } | StoragePointer::Azure { .. } => BackendKind::RangedHttp,
            StoragePointer::Ftp { .. } => BackendKind::Ftp,
            StoragePointer::Sra { .. } => BackendKind::GenericHttp,
        }
    }

    /// The location string file extensions are derived from.
    pub fn location(&self) -> &str {
        match self {
            StoragePointer::S3 { uri, .. } | StoragePointer::Azure { uri, .. } => uri,
            StoragePointer::Ftp { url } | StoragePointer::Sra { url } => url,
        }
    }
}

/// Rejects values whose JSON text does not parse back to an identical value.
pub fn check_json_round_trip(value: &Value) -> Result<(), KiraError> {
    let text = serde_json::to_string(value).map_err(|err| KiraError::JsonRoundTrip(err.to_string()))?;
    let parsed: Value =
        serde_json::from_str(&text).map_err(|err| KiraError::JsonRoundTrip(err.to_string()))?;
    if &parsed != value {
        return Err(KiraError::JsonRoundTrip(format!("{value} became {parsed}")));
    }
    Ok(())
}

fn cloud_blob(
    kind: &str,
    uri: &str,
    endpoint_url: &Option<String>,
    presigned_url: &Option<String>,
) -> Value {
    let mut blob = Map::new();
    blob.insert("__type__".to_string(), json!(kind));
    blob.insert("uri".to_string(), json!(uri));
    if let Some(endpoint) = endpoint_url {
        blob.insert("endpoint_url".to_string(), json!(endpoint));
    }
    if let Some(presigned) = presigned_url {
        blob.insert("presigned_url".to_string(), json!(presigned));
    }
    Value::Object(blob)
}

fn first_key(object: &Map<String, Value>, keys: &[&str]) -> Result<String, KiraError> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| {
            KiraError::InvalidStoragePointer(format!("missing one of {}", keys.join(", ")))
        })
}

fn optional_key(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}
