//! SSH access to application shells
//!
//! The SSH username names the application. A session is admitted when the
//! offered public key equals a key of one of the application's owners or of
//! an admin, and is then attached to a shell in the application container.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, ExecStreams};
use crate::domain::Application;
use crate::error::{Error, Result};

/// Command started for an admitted session
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// An OpenSSH public key (`<algorithm> <base64 blob> [comment]`)
#[derive(Clone, Debug)]
pub struct PublicKey {
    algorithm: String,
    blob: Vec<u8>,
    comment: Option<String>,
}

impl PublicKey {
    /// Parse one `authorized_keys`-style line
    pub fn parse(line: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::ValidationError(format!("invalid public key: {reason}"));

        let mut parts = line.split_whitespace();
        let algorithm = parts.next().ok_or_else(|| invalid("empty"))?;
        let encoded = parts.next().ok_or_else(|| invalid("missing key data"))?;
        let comment = parts.collect::<Vec<_>>().join(" ");

        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| invalid(&e.to_string()))?;
        // the blob starts with the algorithm as a length-prefixed string
        let embedded = read_string(&blob).ok_or_else(|| invalid("truncated key data"))?;
        if embedded != algorithm.as_bytes() {
            return Err(invalid("algorithm does not match key data"));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            blob,
            comment: (!comment.is_empty()).then_some(comment),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// `SHA256:<base64>` fingerprint as printed by `ssh-keygen -l`
    pub fn fingerprint(&self) -> String {
        format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&self.blob)))
    }
}

/// Keys are equal when algorithm and key data match; comments are ignored
impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.blob == other.blob
    }
}

impl Eq for PublicKey {}

fn read_string(data: &[u8]) -> Option<&[u8]> {
    let len = u32::from_be_bytes(data.get(..4)?.try_into().ok()?) as usize;
    data.get(4..4 + len)
}

/// Source of applications and user keys for authentication
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn application(&self, app_id: &str) -> Result<Option<Application>>;

    /// Public keys registered by a user, in `authorized_keys` format
    async fn user_keys(&self, user_id: &str) -> Result<Vec<String>>;

    /// Public keys of every admin user
    async fn admin_keys(&self) -> Result<Vec<String>>;
}

/// Admits SSH sessions and attaches them to application shells
pub struct ShellGate<P> {
    provider: P,
    backend: Arc<dyn Backend>,
    shell: Vec<String>,
}

impl<P: KeyProvider> ShellGate<P> {
    pub fn new(provider: P, backend: Arc<dyn Backend>) -> Self {
        Self {
            provider,
            backend,
            shell: vec![DEFAULT_SHELL.to_string()],
        }
    }

    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    /// Whether `offered` may open a shell in application `username`
    #[instrument(skip(self, offered), fields(fingerprint = %offered.fingerprint()))]
    pub async fn authenticate(&self, username: &str, offered: &PublicKey) -> Result<bool> {
        let Some(app) = self.provider.application(username).await? else {
            debug!("Unknown application");
            return Ok(false);
        };

        let mut candidates = self.provider.admin_keys().await?;
        for owner in &app.owner_ids {
            candidates.extend(self.provider.user_keys(owner).await?);
        }

        let admitted = candidates.iter().any(|line| match PublicKey::parse(line) {
            Ok(key) => key == *offered,
            Err(e) => {
                warn!("Skipping stored key: {}", e);
                false
            }
        });
        if admitted {
            info!("SSH session admitted");
        } else {
            debug!("Public key rejected");
        }
        Ok(admitted)
    }

    /// Attach `streams` to a shell in the application's running container
    #[instrument(skip(self, streams))]
    pub async fn attach(&self, app_id: &str, streams: ExecStreams) -> Result<()> {
        let container = self.backend.get_container(app_id).await?;
        if !container.state.is_running() {
            return Err(Error::ExecError(format!(
                "application {} is not running ({:?})",
                app_id, container.state
            )));
        }
        self.backend
            .exec_container(app_id, &self.shell, streams)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::domain::ContainerState;
    use crate::test_support::{runtime_app, FakeBackend};

    fn key_line(algorithm: &str, seed: u8, comment: &str) -> String {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(algorithm.len() as u32).to_be_bytes());
        blob.extend_from_slice(algorithm.as_bytes());
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[seed; 32]);
        format!("{} {} {}", algorithm, STANDARD.encode(blob), comment)
    }

    struct Keys {
        users: HashMap<String, Vec<String>>,
        admins: Vec<String>,
    }

    #[async_trait]
    impl KeyProvider for Keys {
        async fn application(&self, app_id: &str) -> Result<Option<Application>> {
            Ok((app_id == "a1").then(|| runtime_app("a1", vec![])))
        }

        async fn user_keys(&self, user_id: &str) -> Result<Vec<String>> {
            Ok(self.users.get(user_id).cloned().unwrap_or_default())
        }

        async fn admin_keys(&self) -> Result<Vec<String>> {
            Ok(self.admins.clone())
        }
    }

    fn streams() -> ExecStreams {
        ExecStreams {
            stdin: Box::new(tokio::io::empty()),
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        }
    }

    fn gate(backend: Arc<FakeBackend>) -> ShellGate<Keys> {
        let keys = Keys {
            users: HashMap::from([(
                "owner-1".to_string(),
                vec![key_line("ssh-ed25519", 1, "owner@laptop")],
            )]),
            admins: vec!["garbage".to_string(), key_line("ssh-ed25519", 9, "admin")],
        };
        ShellGate::new(keys, backend)
    }

    #[test]
    fn test_parse_public_key() {
        let key = PublicKey::parse(&key_line("ssh-ed25519", 1, "me@host")).unwrap();
        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.comment(), Some("me@host"));
        assert!(key.fingerprint().starts_with("SHA256:"));

        // comment does not take part in equality
        let other = PublicKey::parse(&key_line("ssh-ed25519", 1, "")).unwrap();
        assert_eq!(key, other);
        assert!(other.comment().is_none());
    }

    #[test]
    fn test_parse_rejects_mismatched_algorithm() {
        let line = key_line("ssh-ed25519", 1, "");
        let swapped = line.replacen("ssh-ed25519", "ssh-rsa", 1);
        assert!(PublicKey::parse(&swapped).is_err());
        assert!(PublicKey::parse("ssh-ed25519 !!!").is_err());
        assert!(PublicKey::parse("").is_err());
    }

    #[tokio::test]
    async fn test_owner_and_admin_keys_are_admitted() {
        let gate = gate(Arc::new(FakeBackend::default()));
        let owner = PublicKey::parse(&key_line("ssh-ed25519", 1, "")).unwrap();
        let admin = PublicKey::parse(&key_line("ssh-ed25519", 9, "")).unwrap();
        let stranger = PublicKey::parse(&key_line("ssh-ed25519", 5, "")).unwrap();

        assert!(gate.authenticate("a1", &owner).await.unwrap());
        assert!(gate.authenticate("a1", &admin).await.unwrap());
        assert!(!gate.authenticate("a1", &stranger).await.unwrap());
        assert!(!gate.authenticate("unknown", &owner).await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_runs_shell_in_running_container() {
        let backend = Arc::new(FakeBackend {
            state: Some(ContainerState::Running),
            ..Default::default()
        });
        gate(backend.clone()).attach("a1", streams()).await.unwrap();
        let execs = backend.execs.lock().unwrap();
        assert_eq!(execs.as_slice(), &[("a1".to_string(), vec!["/bin/sh".to_string()])]);
    }

    #[tokio::test]
    async fn test_attach_requires_running_container() {
        let backend = Arc::new(FakeBackend::default());
        let err = gate(backend.clone()).attach("a1", streams()).await.unwrap_err();
        assert!(matches!(err, Error::ExecError(_)));
        assert!(backend.execs.lock().unwrap().is_empty());
    }
}
