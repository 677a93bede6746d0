//! Principal and authorization seam.
//!
//! The engine never decides policy itself; it asks an [`Authorizer`] and
//! treats the answer as opaque.

use serde::{Deserialize, Serialize};

/// The already-resolved caller attached to every management command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Management operation being authorized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    ReplayParked,
    ReadNext,
    Attach,
    Stats,
}

/// Outcome of an authorization check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// Capability check supplied by the identity collaborator.
pub trait Authorizer: Send + Sync {
    /// `target` is the stream id, or `None` for engine-wide requests.
    fn check(&self, principal: &Principal, operation: Operation, target: Option<&str>) -> Access;
}

/// Grants everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check(&self, _: &Principal, _: Operation, _: Option<&str>) -> Access {
        Access::Allowed
    }
}

/// Grants management operations to principals holding a role; reads to anyone.
#[derive(Clone, Debug)]
pub struct RoleAuthorizer {
    pub admin_role: String,
}

impl RoleAuthorizer {
    pub fn new(admin_role: impl Into<String>) -> Self {
        Self {
            admin_role: admin_role.into(),
        }
    }
}

impl Authorizer for RoleAuthorizer {
    fn check(&self, principal: &Principal, operation: Operation, _: Option<&str>) -> Access {
        match operation {
            Operation::ReadNext | Operation::Attach | Operation::Stats => Access::Allowed,
            _ if principal.has_role(&self.admin_role) => Access::Allowed,
            _ => Access::Denied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_authorizer() {
        let auth = RoleAuthorizer::new("$admins");
        let admin = Principal::new("ops").with_roles(vec!["$admins".into()]);
        let reader = Principal::new("svc");

        assert_eq!(auth.check(&admin, Operation::Delete, Some("orders")), Access::Allowed);
        assert_eq!(auth.check(&reader, Operation::Delete, Some("orders")), Access::Denied);
        assert_eq!(auth.check(&reader, Operation::ReadNext, Some("orders")), Access::Allowed);
    }
}
