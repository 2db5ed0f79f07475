use std::sync::Arc;

use crate::cache::BlobCache;
use crate::config::ResolvedConfig;
use crate::error::KiraError;
use crate::resources::Organization;
use crate::transport::{HttpTransport, Transport};

/// A transport plus the blob cache it is paired with.
///
/// Cloning is cheap; every resource keeps its own clone. Sessions built from
/// different configs never share state, so copying between two servers is
/// just two sessions.
#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn Transport>,
    cache: Arc<BlobCache>,
}

impl Session {
    pub fn new(transport: impl Transport + 'static, cache: BlobCache) -> Self {
        Self {
            transport: Arc::new(transport),
            cache: Arc::new(cache),
        }
    }

    pub fn from_shared(transport: Arc<dyn Transport>, cache: BlobCache) -> Self {
        Self {
            transport,
            cache: Arc::new(cache),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, KiraError> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(transport, BlobCache::new(config.cache.clone())))
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    pub fn organization(&self, name: impl Into<String>) -> Organization {
        Organization::new(self.clone(), name)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.transport.endpoint_url())
            .field("cache", &self.cache)
            .finish()
    }
}
