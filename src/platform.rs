//! Hosting Platform
//!
//! Describes the Git hosting platform the managed SSH block targets, and the
//! REST collaborator that decrypted tokens are handed to. This crate performs
//! no HTTP itself; embedders implement [`PlatformApi`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// SSH-facing description of a hosting platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformHost {
    /// Display name
    pub name: String,
    /// Canonical SSH host; a `Host` block with exactly this pattern is managed
    pub ssh_host: String,
    /// Login user for Git over SSH
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Substring of the banner printed after a successful `ssh -T`
    pub greeting: String,
    /// REST endpoint handed to [`PlatformApi`] implementations
    pub api_url: String,
}

impl Default for PlatformHost {
    fn default() -> Self {
        Self::github()
    }
}

impl PlatformHost {
    pub fn github() -> Self {
        Self {
            name: "GitHub".to_string(),
            ssh_host: "github.com".to_string(),
            ssh_user: default_ssh_user(),
            greeting: "successfully authenticated".to_string(),
            api_url: "https://api.github.com".to_string(),
        }
    }

    pub fn gitlab() -> Self {
        Self {
            name: "GitLab".to_string(),
            ssh_host: "gitlab.com".to_string(),
            ssh_user: default_ssh_user(),
            greeting: "Welcome to GitLab".to_string(),
            api_url: "https://gitlab.com/api/v4".to_string(),
        }
    }
}

fn default_ssh_user() -> String {
    "git".to_string()
}

/// Errors reported by a platform API implementation
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Token rejected by platform: {0}")]
    Unauthorized(String),

    #[error("Platform request failed: {0}")]
    Request(String),
}

/// REST operations that consume an identity's decrypted token
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Account name the token belongs to
    async fn whoami(&self, token: &str) -> Result<String, PlatformError>;

    /// Register a public key with the account
    async fn upload_public_key(
        &self,
        token: &str,
        title: &str,
        public_key: &str,
    ) -> Result<(), PlatformError>;

    /// Repositories visible to the account (`owner/name`)
    async fn list_repos(&self, token: &str) -> Result<Vec<String>, PlatformError>;
}
