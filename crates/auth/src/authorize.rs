use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use forgeledger_core::{LedgerError, PolicyError, TenantId, UserId};

use crate::Role;

/// The authenticated user a workflow operation is performed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    /// Roles asserted by the caller's token.
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(user_id: UserId, tenant_id: TenantId, roles: Vec<Role>) -> Self {
        Self {
            user_id,
            tenant_id,
            roles,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing role '{0}'")]
    MissingRole(String),
}

impl From<AuthzError> for LedgerError {
    fn from(value: AuthzError) -> Self {
        match value {
            AuthzError::TenantMismatch => PolicyError::CrossTenant.into(),
            AuthzError::MissingRole(role) => PolicyError::InsufficientRole(role).into(),
        }
    }
}

/// Role lookup collaborator consulted by the posting workflow.
pub trait Authorizer: Send + Sync {
    fn actor_has_role(&self, actor: &Actor, role: &Role) -> bool;
}

impl<A: Authorizer + ?Sized> Authorizer for std::sync::Arc<A> {
    fn actor_has_role(&self, actor: &Actor, role: &Role) -> bool {
        (**self).actor_has_role(actor, role)
    }
}

/// Trusts the roles carried by the actor (i.e. by its verified token).
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimedRoles;

impl Authorizer for ClaimedRoles {
    fn actor_has_role(&self, actor: &Actor, role: &Role) -> bool {
        actor.roles.iter().any(|r| r.is_admin() || r == role)
    }
}

/// Server-side role grants per (tenant, user); ignores claimed roles.
#[derive(Debug, Default)]
pub struct InMemoryRoleGrants {
    grants: RwLock<HashMap<(TenantId, UserId), HashSet<Role>>>,
}

impl InMemoryRoleGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, tenant_id: TenantId, user_id: UserId, role: Role) {
        if let Ok(mut grants) = self.grants.write() {
            grants.entry((tenant_id, user_id)).or_default().insert(role);
        }
    }

    pub fn revoke(&self, tenant_id: TenantId, user_id: UserId, role: &Role) {
        if let Ok(mut grants) = self.grants.write() {
            if let Some(roles) = grants.get_mut(&(tenant_id, user_id)) {
                roles.remove(role);
            }
        }
    }
}

impl Authorizer for InMemoryRoleGrants {
    fn actor_has_role(&self, actor: &Actor, role: &Role) -> bool {
        // A poisoned lock denies.
        let Ok(grants) = self.grants.read() else {
            return false;
        };
        grants
            .get(&(actor.tenant_id, actor.user_id))
            .is_some_and(|roles| roles.iter().any(|r| r.is_admin() || r == role))
    }
}

/// Check `role` for `actor` acting inside `tenant_id`.
pub fn require_role(
    authorizer: &dyn Authorizer,
    actor: &Actor,
    tenant_id: TenantId,
    role: &Role,
) -> Result<(), AuthzError> {
    if actor.tenant_id != tenant_id {
        return Err(AuthzError::TenantMismatch);
    }
    if authorizer.actor_has_role(actor, role) {
        Ok(())
    } else {
        Err(AuthzError::MissingRole(role.as_str().to_string()))
    }
}
