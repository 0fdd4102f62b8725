//! Role resolution: verified identity → entitlement set
//!
//! Resolution is a pure lookup against [`AuthConfig`]. Identities from an
//! issuer outside the trusted registry resolve to an empty grant.

use procedure_types::{Actor, RoleName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The output of upstream token validation: who the caller is and which
/// groups their issuer asserts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub subject: String,
    pub issuer: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl VerifiedIdentity {
    pub fn new(subject: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            issuer: issuer.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// History actor for this identity
    pub fn actor(&self) -> Actor {
        Actor::identity(self.subject.clone(), self.issuer.clone())
    }
}

/// Maps one role category to the group claims that confer it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMapping {
    pub role: RoleName,
    #[serde(default)]
    pub entitlements: Vec<String>,
}

impl RoleMapping {
    pub fn new<I, S>(role: RoleName, entitlements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role,
            entitlements: entitlements.into_iter().map(Into::into).collect(),
        }
    }
}

/// Trusted issuers plus the entitlement mapping table
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub trusted_issuers: Vec<String>,
    #[serde(default)]
    pub roles: Vec<RoleMapping>,
}

impl AuthConfig {
    pub fn with_trusted_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.trusted_issuers.push(issuer.into());
        self
    }

    pub fn with_role(mut self, mapping: RoleMapping) -> Self {
        self.roles.push(mapping);
        self
    }
}

/// The entitlements held for one authorization decision
///
/// Grants are derived per call and never cached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleGrant {
    roles: BTreeSet<RoleName>,
}

impl RoleGrant {
    pub fn new(roles: impl IntoIterator<Item = RoleName>) -> Self {
        Self {
            roles: roles.into_iter().collect(),
        }
    }

    pub fn contains(&self, role: &RoleName) -> bool {
        self.roles.contains(role)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleName> {
        self.roles.iter()
    }
}

/// Derives [`RoleGrant`]s from verified identities
#[derive(Clone, Debug, Default)]
pub struct RoleResolver {
    config: AuthConfig,
}

impl RoleResolver {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Is `issuer` in the trusted registry? Trailing slashes are ignored.
    pub fn is_trusted(&self, issuer: &str) -> bool {
        let issuer = issuer.trim_end_matches('/');
        self.config
            .trusted_issuers
            .iter()
            .any(|trusted| trusted.trim_end_matches('/') == issuer)
    }

    /// Resolve the roles an identity holds. Fails closed.
    pub fn resolve(&self, identity: &VerifiedIdentity) -> RoleGrant {
        if !self.is_trusted(&identity.issuer) {
            tracing::debug!(
                subject = %identity.subject,
                issuer = %identity.issuer,
                "Issuer not trusted, granting no roles"
            );
            return RoleGrant::default();
        }

        let roles = self
            .config
            .roles
            .iter()
            .filter(|mapping| {
                mapping
                    .entitlements
                    .iter()
                    .any(|entitlement| identity.groups.contains(entitlement))
            })
            .map(|mapping| mapping.role.clone());
        RoleGrant::new(roles)
    }
}
