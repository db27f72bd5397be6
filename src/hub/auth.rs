//! User identity and invocation authorization
//!
//! Hubs and individual methods name the policies a caller must satisfy. An
//! [`Authorizer`] evaluates each policy for the connection's [`HubUser`]; the
//! built-in [`PolicyAuthorizer`] maps policy names to predicates.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// User
// =============================================================================

/// Identity attached to a connection by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubUser {
    /// Stable user identifier used for user addressing
    pub id: Option<String>,

    /// Display name
    pub name: Option<String>,

    /// Role memberships
    pub roles: Vec<String>,

    /// Free-form claims
    pub claims: HashMap<String, String>,
}

impl HubUser {
    /// An unauthenticated user
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An authenticated user with the given identifier
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

// =============================================================================
// Authorizer
// =============================================================================

/// What is being authorized: the hub method and the arguments it was called with.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationResource<'a> {
    pub connection_id: &'a str,
    pub method: &'a str,
    pub arguments: &'a [Value],
}

/// Evaluates a named policy for a user.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(
        &self,
        user: &HubUser,
        policy: &str,
        resource: &AuthorizationResource<'_>,
    ) -> bool;
}

type PolicyFn = Arc<dyn Fn(&HubUser, &AuthorizationResource<'_>) -> bool + Send + Sync>;

/// Authorizer backed by named predicates. Unknown policies deny.
#[derive(Clone, Default)]
pub struct PolicyAuthorizer {
    policies: HashMap<String, PolicyFn>,
}

impl PolicyAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate under `name`
    pub fn with_policy<F>(mut self, name: impl Into<String>, policy: F) -> Self
    where
        F: Fn(&HubUser, &AuthorizationResource<'_>) -> bool + Send + Sync + 'static,
    {
        self.policies.insert(name.into(), Arc::new(policy));
        self
    }

    /// Policy satisfied by members of `role`
    pub fn require_role(self, name: impl Into<String>, role: impl Into<String>) -> Self {
        let role = role.into();
        self.with_policy(name, move |user, _| user.is_in_role(&role))
    }

    /// Policy satisfied by any authenticated user
    pub fn require_authenticated(self, name: impl Into<String>) -> Self {
        self.with_policy(name, |user, _| user.is_authenticated())
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn authorize(
        &self,
        user: &HubUser,
        policy: &str,
        resource: &AuthorizationResource<'_>,
    ) -> bool {
        match self.policies.get(policy) {
            Some(check) => check(user, resource),
            None => {
                tracing::warn!("Authorization policy '{}' is not registered", policy);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource<'a>(arguments: &'a [Value]) -> AuthorizationResource<'a> {
        AuthorizationResource {
            connection_id: "c1",
            method: "Delete",
            arguments,
        }
    }

    #[tokio::test]
    async fn test_role_policy() {
        let authorizer = PolicyAuthorizer::new().require_role("admins", "admin");
        let args = [];

        let admin = HubUser::with_id("alice").with_role("admin");
        let guest = HubUser::with_id("bob");

        assert!(authorizer.authorize(&admin, "admins", &resource(&args)).await);
        assert!(!authorizer.authorize(&guest, "admins", &resource(&args)).await);
    }

    #[tokio::test]
    async fn test_unknown_policy_denies() {
        let authorizer = PolicyAuthorizer::new();
        let user = HubUser::with_id("alice");
        assert!(!authorizer.authorize(&user, "missing", &resource(&[])).await);
    }

    #[tokio::test]
    async fn test_policy_sees_arguments() {
        let authorizer = PolicyAuthorizer::new().with_policy("small", |_, res| {
            res.arguments
                .first()
                .and_then(Value::as_i64)
                .is_some_and(|n| n < 10)
        });
        let user = HubUser::anonymous();

        assert!(authorizer.authorize(&user, "small", &resource(&[json!(3)])).await);
        assert!(!authorizer.authorize(&user, "small", &resource(&[json!(30)])).await);
    }
}
