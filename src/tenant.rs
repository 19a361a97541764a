use std::fmt;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::TenantId;

/// The operator tenant. Admins and owners here are platform admins.
pub const PLATFORM_TENANT: TenantId = Ulid::nil();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The principal maps to no tenant at all.
    Unauthorized,
    /// The principal exists but may not act here.
    Forbidden,
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Unauthorized => write!(f, "unauthorized"),
            AccessError::Forbidden => write!(f, "forbidden"),
        }
    }
}

impl std::error::Error for AccessError {}

/// An authenticated caller, as handed over by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    /// Tenant the caller wants to act in.
    pub tenant_id: TenantId,
}

/// Which tenants a read should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Own,
    Tenant(TenantId),
    /// Platform admins only.
    All,
}

/// Resolved caller identity. Passed explicitly to every engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub subject: String,
    pub role: Role,
    pub is_platform_admin: bool,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, subject: impl Into<String>, role: Role) -> Self {
        Self {
            tenant_id,
            subject: subject.into(),
            role,
            is_platform_admin: false,
        }
    }

    /// Context for scheduled jobs: platform admin acting on the platform tenant.
    pub fn system() -> Self {
        Self {
            tenant_id: PLATFORM_TENANT,
            subject: "scheduler".into(),
            role: Role::Owner,
            is_platform_admin: true,
        }
    }

    pub fn can_access(&self, tenant_id: TenantId) -> bool {
        self.is_platform_admin || self.tenant_id == tenant_id
    }

    pub fn require(&self, role: Role) -> Result<(), AccessError> {
        if self.is_platform_admin || self.role >= role {
            Ok(())
        } else {
            Err(AccessError::Forbidden)
        }
    }

    /// Turn a requested scope into a tenant filter; `None` means every tenant.
    pub fn filter(&self, scope: Scope) -> Result<Option<TenantId>, AccessError> {
        match scope {
            Scope::Own => Ok(Some(self.tenant_id)),
            Scope::Tenant(t) if self.can_access(t) => Ok(Some(t)),
            Scope::All if self.is_platform_admin => Ok(None),
            Scope::Tenant(_) | Scope::All => Err(AccessError::Forbidden),
        }
    }
}

/// Membership table fed by the tenant/user collaborator.
#[derive(Default)]
pub struct TenantDirectory {
    members: DashMap<String, Vec<(TenantId, Role)>>,
}

impl TenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, subject: &str, tenant_id: TenantId, role: Role) {
        let mut entry = self.members.entry(subject.to_string()).or_default();
        if let Some(pos) = entry.iter().position(|(t, _)| *t == tenant_id) {
            entry[pos].1 = role;
        } else {
            entry.push((tenant_id, role));
        }
    }

    pub fn revoke(&self, subject: &str, tenant_id: TenantId) {
        if let Some(mut entry) = self.members.get_mut(subject) {
            entry.retain(|(t, _)| *t != tenant_id);
        }
    }

    fn role_in(&self, subject: &str, tenant_id: TenantId) -> Option<Role> {
        self.members.get(subject).and_then(|m| {
            m.iter()
                .find(|(t, _)| *t == tenant_id)
                .map(|(_, role)| *role)
        })
    }

    pub fn is_platform_admin(&self, subject: &str) -> bool {
        self.role_in(subject, PLATFORM_TENANT)
            .is_some_and(|role| role >= Role::Admin)
    }

    pub fn resolve(&self, principal: &Principal) -> Result<TenantContext, AccessError> {
        let has_any = self
            .members
            .get(&principal.subject)
            .is_some_and(|m| !m.is_empty());
        if !has_any {
            return Err(AccessError::Unauthorized);
        }

        let is_platform_admin = self.is_platform_admin(&principal.subject);
        let role = match self.role_in(&principal.subject, principal.tenant_id) {
            Some(role) => role,
            None if is_platform_admin => Role::Owner,
            None => return Err(AccessError::Forbidden),
        };
        Ok(TenantContext {
            tenant_id: principal.tenant_id,
            subject: principal.subject.clone(),
            role,
            is_platform_admin,
        })
    }
}
