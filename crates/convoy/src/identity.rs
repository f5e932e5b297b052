//! Bot identity probe.
//!
//! The supervisor resolves the bot's own id once per start so the mention
//! trigger can tell "@bot" apart from "@someone". Failure is not fatal.

use async_trait::async_trait;
use convoy_protocol::BotIdentity;
use thiserror::Error;

use crate::config::{CredentialsConfig, IdentityConfig};

/// Credentials handed to the probe.
#[derive(Clone, Default)]
pub struct Credentials {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(config: &CredentialsConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("identity service unavailable: {0}")]
    Unavailable(String),

    #[error("credentials rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait IdentityProbe: Send + Sync {
    async fn probe(&self, credentials: &Credentials) -> Result<BotIdentity, ProbeError>;
}

/// Identity taken straight from config.
pub struct StaticIdentityProbe {
    identity: Option<BotIdentity>,
}

impl StaticIdentityProbe {
    pub fn new(identity: Option<BotIdentity>) -> Self {
        Self { identity }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        let identity = config.bot_id.as_ref().map(|id| BotIdentity {
            id: id.clone(),
            name: config.bot_name.clone(),
        });
        Self::new(identity)
    }
}

#[async_trait]
impl IdentityProbe for StaticIdentityProbe {
    async fn probe(&self, _credentials: &Credentials) -> Result<BotIdentity, ProbeError> {
        self.identity
            .clone()
            .ok_or_else(|| ProbeError::Unavailable("identity.bot_id is not configured".to_string()))
    }
}
