use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lookout_core::error::AppError;
use lookout_core::traits::Extractor;
use serde::Deserialize;

use crate::error::FetchError;
use crate::session::HttpSession;
use crate::source::{SourceConfig, SourceExtractor};

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    sources: HashMap<String, SourceConfig>,
}

/// Endpoint ID to source mapping; the [`Extractor`] handed to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: Arc<HashMap<String, SourceExtractor>>,
}

impl SourceCatalog {
    pub fn from_configs(configs: &HashMap<String, SourceConfig>) -> Result<Self, AppError> {
        let sources = configs
            .iter()
            .map(|(endpoint, config)| {
                SourceExtractor::from_config(config)
                    .map(|source| (endpoint.clone(), source))
                    .map_err(|e| AppError::ConfigError(format!("sources.{endpoint}: {e}")))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self {
            sources: Arc::new(sources),
        })
    }

    /// Read the `sources` table of a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: CatalogFile = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("invalid JSON in {}: {e}", path.display()))
        })?;
        Self::from_configs(&file.sources)
    }

    pub fn insert(&mut self, endpoint: impl Into<String>, source: SourceExtractor) {
        Arc::make_mut(&mut self.sources).insert(endpoint.into(), source);
    }

    pub fn get(&self, endpoint: &str) -> Option<&SourceExtractor> {
        self.sources.get(endpoint)
    }

    /// Configured endpoint IDs, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.sources.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Extractor<HttpSession> for SourceCatalog {
    type Error = FetchError;

    async fn extract(
        &self,
        endpoint: &str,
        identifier: &str,
        session: &HttpSession,
    ) -> Result<serde_json::Value, FetchError> {
        let source = self
            .get(endpoint)
            .ok_or_else(|| FetchError::UnknownEndpoint(endpoint.to_string()))?;
        tracing::debug!(%endpoint, %identifier, kind = source.kind(), "Fetching");
        source
            .fetch(identifier, session.client(), session.timeout())
            .await
    }
}
