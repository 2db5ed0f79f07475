use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::KiraError;
use crate::upload::TransferConfig;

pub const DEFAULT_ENDPOINT: &str = "https://backend.geoseeq.com";
pub const DEFAULT_PROFILE: &str = "default";
const PROFILES_FILE: &str = "profiles.json";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ProfilesFile {
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_token: None,
        }
    }
}

/// Environment variables captured once so resolution stays a pure function.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub profile: Option<String>,
    pub endpoint: Option<String>,
    pub api_token: Option<String>,
    pub config_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub use_cache: Option<String>,
    pub no_ssl_verification: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            profile: read("KIRA_SYNC_PROFILE"),
            endpoint: read("KIRA_SYNC_ENDPOINT"),
            api_token: read("KIRA_SYNC_API_TOKEN"),
            config_dir: read("KIRA_SYNC_CONFIG_DIR"),
            cache_dir: read("KIRA_SYNC_CACHE_DIR"),
            use_cache: read("KIRA_SYNC_USE_CACHE"),
            no_ssl_verification: read("KIRA_SYNC_NO_SSL_VERIFICATION"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub profile: String,
    pub endpoint: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub verify_tls: bool,
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `profiles.json` (explicit path, `KIRA_SYNC_CONFIG_DIR`, or the
    /// platform config dir) and applies environment overrides.
    pub fn resolve(path: Option<&str>, profile: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let env = EnvOverrides::from_env();
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => default_profiles_path(&env),
        };

        let file = match config_path {
            Some(config_path) if config_path.exists() => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
                serde_json::from_str(&content)
                    .map_err(|err| KiraError::ConfigParse(err.to_string()))?
            }
            Some(config_path) if path.is_some() => {
                return Err(KiraError::ConfigRead(config_path));
            }
            _ => ProfilesFile::default(),
        };

        Self::resolve_config(file, profile, &env)
    }

    pub fn resolve_config(
        file: ProfilesFile,
        profile: Option<&str>,
        env: &EnvOverrides,
    ) -> Result<ResolvedConfig, KiraError> {
        let explicit = profile.map(str::to_string).or_else(|| env.profile.clone());
        let name = explicit.clone().unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        let selected = match file.profiles.get(&name) {
            Some(found) => found.clone(),
            None if explicit.is_some() && name != DEFAULT_PROFILE => {
                return Err(KiraError::UnknownProfile(name));
            }
            None => Profile::default(),
        };

        let endpoint = env
            .endpoint
            .clone()
            .unwrap_or(selected.endpoint)
            .trim_end_matches('/')
            .to_string();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(KiraError::InvalidConfig(format!(
                "endpoint must be an http(s) URL: {endpoint}"
            )));
        }
        let api_token = env.api_token.clone().or(selected.api_token);

        let mut cache = CacheConfig::default();
        if let Some(dir) = &env.cache_dir {
            cache.root = Utf8PathBuf::from(dir.as_str());
        }
        if let Some(flag) = &env.use_cache {
            cache.enabled = !flag.to_lowercase().contains("false");
        }

        let verify_tls = !env
            .no_ssl_verification
            .as_deref()
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(ResolvedConfig {
            profile: name,
            endpoint,
            api_token,
            request_timeout: Duration::from_secs(60),
            verify_tls,
            cache,
            transfer: TransferConfig::default(),
        })
    }
}

fn default_profiles_path(env: &EnvOverrides) -> Option<PathBuf> {
    if let Some(dir) = &env.config_dir {
        return Some(PathBuf::from(dir).join(PROFILES_FILE));
    }
    BaseDirs::new().map(|dirs| dirs.config_dir().join("kira-sync").join(PROFILES_FILE))
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
