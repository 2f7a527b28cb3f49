//! # Deployments Address Book
//!
//! Maps chain ids to the GlucoseCheck deployment on that chain. Entries pointing at the
//! zero address are placeholders for chains where the contract was never deployed.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Address, ChainId, GlucoseCheckError, GlucoseCheckResult};

/// A single deployment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub address: Address,
    pub chain_id: ChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
}

/// Address book keyed by chain id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deployments {
    entries: BTreeMap<String, Deployment>,
}

impl Deployments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON address book (`{"31337": {"address": ..., "chainId": ...}}`)
    pub fn load(path: &Path) -> GlucoseCheckResult<Self> {
        if !path.exists() {
            debug!("No deployments file at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| GlucoseCheckError::Storage(format!("read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> GlucoseCheckResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GlucoseCheckError::Storage(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| GlucoseCheckError::Storage(format!("write {}: {}", path.display(), e)))
    }

    /// Insert or replace the deployment for its chain id
    pub fn insert(&mut self, deployment: Deployment) {
        self.entries.insert(deployment.chain_id.to_string(), deployment);
    }

    /// Resolve the live deployment for a chain. Missing and zero-address entries resolve to `None`.
    pub fn resolve(&self, chain_id: ChainId) -> Option<&Deployment> {
        self.entries
            .get(&chain_id.to_string())
            .filter(|d| !d.address.is_zero())
    }

    pub fn is_deployed(&self, chain_id: ChainId) -> bool {
        self.resolve(chain_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Deployment> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Deployment> for Deployments {
    fn from_iter<I: IntoIterator<Item = Deployment>>(iter: I) -> Self {
        let mut deployments = Deployments::new();
        for d in iter {
            deployments.insert(d);
        }
        deployments
    }
}
