//! Authentication and authorization module
//!
//! Verifies bearer JWTs minted by the deployment's identity provider and
//! maps their role claim onto what an operator may do.

mod jwt;
mod middleware;

pub use jwt::{decode_token, Claims};
pub use middleware::{auth_middleware, require_role};

#[cfg(test)]
pub use jwt::issue_token;

use serde::{Deserialize, Serialize};

/// Operator roles for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only endpoints
    #[default]
    Viewer,
    /// Can clone, back up and compare
    Operator,
    /// Can restore, roll back and delete backups
    Admin,
}

impl Role {
    pub fn can_operate(&self) -> bool {
        matches!(self, Role::Operator | Role::Admin)
    }

    pub fn can_restore(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn satisfies(&self, required: Role) -> bool {
        match required {
            Role::Viewer => true,
            Role::Operator => self.can_operate(),
            Role::Admin => self.can_restore(),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::Operator => write!(f, "operator"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_hierarchy() {
        assert!(Role::Admin.satisfies(Role::Operator));
        assert!(Role::Operator.satisfies(Role::Viewer));
        assert!(!Role::Operator.satisfies(Role::Admin));
        assert!(!Role::Viewer.satisfies(Role::Operator));
    }
}
