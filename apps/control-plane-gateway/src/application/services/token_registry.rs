//! Token Registry
//!
//! Accepted bootstrap tokens come from configuration and are reusable:
//! every node that holds one can enroll. Each enrollment issues a distinct
//! UUID node token that stays valid until revoked. A node enrolling again
//! under the same name replaces its previous token, so restarts do not
//! accumulate records.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::application::ports::{NodeRecord, RegistryError, TokenValidationPort};

#[derive(Debug)]
struct IssuedToken {
    record: NodeRecord,
    node_name: Option<String>,
}

#[derive(Debug, Default)]
struct Nodes {
    by_token: HashMap<String, IssuedToken>,
    by_name: HashMap<String, String>,
}

impl Nodes {
    fn remove(&mut self, node_token: &str) -> Option<NodeRecord> {
        let issued = self.by_token.remove(node_token)?;
        if let Some(name) = issued.node_name {
            self.by_name.remove(&name);
        }
        Some(issued.record)
    }
}

/// In-memory token registry.
pub struct TokenRegistry {
    bootstrap_tokens: HashSet<String>,
    nodes: RwLock<Nodes>,
}

impl TokenRegistry {
    /// Create a registry accepting the given bootstrap tokens.
    #[must_use]
    pub fn new<I, S>(bootstrap_tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bootstrap_tokens: bootstrap_tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
            nodes: RwLock::new(Nodes::default()),
        }
    }

    /// Number of active node tokens.
    #[must_use]
    pub fn active_nodes(&self) -> usize {
        self.nodes.read().by_token.len()
    }

    /// Number of accepted bootstrap tokens.
    #[must_use]
    pub fn bootstrap_token_count(&self) -> usize {
        self.bootstrap_tokens.len()
    }
}

impl TokenValidationPort for TokenRegistry {
    fn enroll(&self, bootstrap_token: &str, node_name: &str) -> Result<String, RegistryError> {
        if !self.bootstrap_tokens.contains(bootstrap_token) {
            return Err(RegistryError::UnknownBootstrapToken);
        }

        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let node_name = (!node_name.is_empty()).then(|| node_name.to_string());

        let mut nodes = self.nodes.write();
        let previous = node_name
            .as_ref()
            .and_then(|name| nodes.by_name.insert(name.clone(), token.clone()));
        if let Some(previous) = previous {
            nodes.by_token.remove(&previous);
            tracing::info!(node_name = ?node_name, "Replaced node token on re-enrollment");
        }
        nodes.by_token.insert(
            token.clone(),
            IssuedToken {
                record: NodeRecord {
                    enrolled_at: now,
                    last_seen: now,
                },
                node_name,
            },
        );

        tracing::debug!(active_nodes = nodes.by_token.len(), "Issued node token");
        Ok(token)
    }

    fn verify_node(&self, node_token: &str) -> Result<NodeRecord, RegistryError> {
        let mut nodes = self.nodes.write();
        let issued = nodes
            .by_token
            .get_mut(node_token)
            .ok_or(RegistryError::UnknownNodeToken)?;
        issued.record.last_seen = Utc::now();
        Ok(issued.record)
    }

    fn revoke(&self, node_token: &str) -> Result<NodeRecord, RegistryError> {
        self.nodes
            .write()
            .remove(node_token)
            .ok_or(RegistryError::UnknownNodeToken)
    }
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("bootstrap_tokens", &self.bootstrap_tokens.len())
            .field("active_nodes", &self.active_nodes())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
