//! Access control for the record RPC surface.
//!
//! The service evaluates `authorize(subject, object, action)` before every
//! append and read. The subject is the mutual-TLS peer common name (empty
//! on plaintext connections) and the action is `append` or `read`. The
//! object is always the wildcard, since a node serves one log.
//!
//! Policy is a JSON map from subject to allowed actions:
//!
//! ```json
//! {
//!   "root": ["append", "read"],
//!   "nobody": []
//! }
//! ```
//!
//! A `"*"` subject entry applies to everyone, and a `"*"` action grants
//! everything. No matching entry means deny.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tonic::Status;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("{subject:?} is not permitted to {action}")]
    Denied { subject: String, action: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

impl From<AclError> for Status {
    fn from(err: AclError) -> Self {
        match err {
            AclError::Denied { .. } => Status::permission_denied(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// The predicate the service consults before every append and read.
pub trait Authorize: Send + Sync {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AclError>;
}

/// File-backed allow-table authorizer.
pub struct Acl {
    rules: HashMap<String, HashSet<String>>,
}

#[derive(Deserialize)]
struct PolicyFile(HashMap<String, Vec<String>>);

impl Acl {
    /// Load a JSON policy file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AclError> {
        let raw = std::fs::read_to_string(path)?;
        let policy: PolicyFile =
            serde_json::from_str(&raw).map_err(|e| AclError::InvalidPolicy(e.to_string()))?;
        Ok(Self::from_rules(policy.0))
    }

    pub fn from_rules(rules: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(subject, actions)| (subject, actions.into_iter().collect()))
                .collect(),
        }
    }

    /// An authorizer that admits everyone, for nodes run without a policy
    /// file.
    pub fn allow_all() -> Self {
        Self::from_rules([("*".to_string(), vec!["*".to_string()])])
    }
}

impl Authorize for Acl {
    fn authorize(&self, subject: &str, _object: &str, action: &str) -> Result<(), AclError> {
        let permits = |s: &str| {
            self.rules
                .get(s)
                .is_some_and(|actions| actions.contains(action) || actions.contains("*"))
        };
        if permits(subject) || permits("*") {
            Ok(())
        } else {
            Err(AclError::Denied {
                subject: subject.to_string(),
                action: action.to_string(),
            })
        }
    }
}
