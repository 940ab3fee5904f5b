//! Signed-in identity.
//!
//! The tracking session and the publisher only read from an
//! [`IdentityProvider`]; acquiring and refreshing credentials happens
//! elsewhere.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::config::{IdentityConfig, ResourceRole};
use crate::error::AuthorizationError;

/// An authenticated user and the roles granted to it.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Username; telemetry topics are parameterized by it.
    pub username: String,
    /// Roles per resource.
    pub roles: HashMap<String, Vec<String>>,
    /// Opaque credential presented to the broker.
    pub credential: Option<String>,
}

impl Identity {
    /// Create an identity without roles.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            roles: HashMap::new(),
            credential: None,
        }
    }

    /// Grant a role on a resource.
    #[must_use]
    pub fn with_role(mut self, resource: impl Into<String>, role: impl Into<String>) -> Self {
        self.roles
            .entry(resource.into())
            .or_default()
            .push(role.into());
        self
    }

    /// Set the credential.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Build the configured identity, if a username is configured.
    pub fn from_config(config: &IdentityConfig) -> Option<Self> {
        let username = config.username.as_ref()?;
        Some(Self {
            username: username.clone(),
            roles: config.roles.clone(),
            credential: config.token.clone(),
        })
    }

    /// Whether `role` is granted on `resource`.
    pub fn has_resource_role(&self, resource: &str, role: &str) -> bool {
        self.roles
            .get(resource)
            .is_some_and(|roles| roles.iter().any(|r| r == role))
    }

    /// Check a role pair, naming what is missing.
    pub fn require(&self, required: &ResourceRole) -> Result<(), AuthorizationError> {
        if self.has_resource_role(&required.resource, &required.role) {
            Ok(())
        } else {
            Err(AuthorizationError::MissingRole {
                username: self.username.clone(),
                resource: required.resource.clone(),
                role: required.role.clone(),
            })
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("roles", &self.roles)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Source of the current identity.
pub trait IdentityProvider: Send + Sync {
    /// Stream of the signed-in identity; `None` while signed out.
    fn current_identity(&self) -> watch::Receiver<Option<Identity>>;

    /// Whether the current identity holds `role` on `resource`.
    fn has_capability(&self, resource: &str, role: &str) -> bool {
        self.current_identity()
            .borrow()
            .as_ref()
            .is_some_and(|identity| identity.has_resource_role(resource, role))
    }

    /// The signed-in identity, or [`AuthorizationError::NoIdentity`].
    fn require_identity(&self) -> Result<Identity, AuthorizationError> {
        self.current_identity()
            .borrow()
            .clone()
            .ok_or(AuthorizationError::NoIdentity)
    }
}

/// Identity provider fed from configuration or by explicit sign-in.
pub struct StaticIdentityProvider {
    broker_access: ResourceRole,
    current: watch::Sender<Option<Identity>>,
}

impl StaticIdentityProvider {
    /// Create a signed-out provider that admits identities holding `broker_access`.
    pub fn new(broker_access: ResourceRole) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            broker_access,
            current,
        }
    }

    /// Create a provider and sign in the configured identity, if any.
    pub fn from_config(config: &IdentityConfig) -> Result<Self, AuthorizationError> {
        let provider = Self::new(config.broker_access.clone());
        if let Some(identity) = Identity::from_config(config) {
            provider.sign_in(identity)?;
        }
        Ok(provider)
    }

    /// Make `identity` current.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError::MissingRole`] when the identity may not
    /// publish to the broker; the current identity is left unchanged.
    pub fn sign_in(&self, identity: Identity) -> Result<(), AuthorizationError> {
        identity.require(&self.broker_access)?;
        info!("Signed in as {}", identity.username);
        self.current.send_replace(Some(identity));
        Ok(())
    }

    /// Clear the current identity.
    pub fn sign_out(&self) {
        if let Some(previous) = self.current.send_replace(None) {
            info!("Signed out {}", previous.username);
        }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn current_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}
