//! CLI subcommand implementations.

pub mod checkin;
pub mod keygen;
pub mod keys;
pub mod listen;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::debug;

use yardlink_client::{AgentConfig, AgentClient, KeyStore, TransportKind};
use yardlink_core::identity::Identity;

/// Flags shared by every subcommand.
pub struct Globals {
    pub config: Option<PathBuf>,
    pub identity: String,
    pub transport: Option<TransportKind>,
}

impl Globals {
    /// Config file with `--transport` applied.
    pub fn load_config(&self) -> Result<AgentConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => AgentConfig::default_path().context("cannot determine home directory")?,
        };
        let mut config = AgentConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?;

        if let Some(kind) = self.transport {
            if let Some(url) = &config.broker.url {
                bail!("--transport conflicts with broker.url = {url}");
            }
            config.broker.transport = kind;
        }
        Ok(config)
    }

    /// The agent identity backed by the `--identity` key.
    pub fn load_identity(&self, uuid: Option<&str>) -> Result<Identity> {
        let keystore = KeyStore::default_location().context("failed to initialize keystore")?;
        let signer = keystore
            .load(&self.identity)
            .with_context(|| format!("failed to load key '{}'", self.identity))?;

        let uuid = match uuid {
            Some(uuid) => uuid.to_string(),
            None => {
                let fingerprint = yardlink_core::identity::key_fingerprint(signer.public_key())?;
                uuid_from_fingerprint(&fingerprint)
            }
        };
        debug!(key = %self.identity, %uuid, "identity loaded");
        Ok(Identity::with_signer(uuid, signer))
    }

    pub fn client(&self, config: &AgentConfig, uuid: Option<&str>) -> Result<AgentClient> {
        let identity = self.load_identity(uuid)?;
        AgentClient::from_config(config, identity).context("failed to set up agent client")
    }
}

/// A stable agent uuid per key: the first 128 bits of its fingerprint in
/// 8-4-4-4-12 form.
pub fn uuid_from_fingerprint(fingerprint: &str) -> String {
    let hex: String = fingerprint.chars().chain(std::iter::repeat('0')).take(32).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_shape_from_fingerprint() {
        let fp = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        assert_eq!(
            uuid_from_fingerprint(fp),
            "01234567-89ab-cdef-0123-456789abcdef"
        );
    }

    #[test]
    fn short_fingerprint_is_padded() {
        assert_eq!(
            uuid_from_fingerprint("abc"),
            "abc00000-0000-0000-0000-000000000000"
        );
    }
}
