//! Principal lookup and the admin gate in front of every console operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KeeperError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub role: Role,
}

/// Source of the identity acting on the console.
pub trait PrincipalResolver: Send + Sync {
    fn current(&self) -> Option<Principal>;
}

/// Resolves a locally known operator name against the configured roles.
/// Unknown names resolve to no principal at all.
#[derive(Debug, Clone)]
pub struct OperatorTable {
    operators: BTreeMap<String, Role>,
    name: Option<String>,
}

impl OperatorTable {
    pub fn new(operators: BTreeMap<String, Role>, name: Option<String>) -> Self {
        Self { operators, name }
    }

    /// Uses `$USER` (or `$USERNAME`) when no explicit name is given.
    pub fn from_env(operators: BTreeMap<String, Role>, explicit: Option<String>) -> Self {
        let name = explicit
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok());
        Self::new(operators, name)
    }
}

impl PrincipalResolver for OperatorTable {
    fn current(&self) -> Option<Principal> {
        let name = self.name.as_ref()?;
        let role = *self.operators.get(name)?;
        Some(Principal {
            name: name.clone(),
            role,
        })
    }
}

pub fn require_admin(resolver: &dyn PrincipalResolver) -> Result<Principal> {
    match resolver.current() {
        None => {
            warn!("operation refused: no principal");
            Err(KeeperError::Unauthenticated)
        }
        Some(p) if p.role != Role::Admin => {
            warn!(operator = %p.name, "operation refused: not an admin");
            Err(KeeperError::Forbidden(p.name))
        }
        Some(p) => Ok(p),
    }
}
