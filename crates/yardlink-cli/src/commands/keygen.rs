//! `yardlink keygen [name]`: generate an RSA key pair.

use anyhow::{Context, Result};
use tracing::info;

use yardlink_client::KeyStore;

/// Generate a new key pair and store it in the keystore.
pub async fn run(name: &str) -> Result<()> {
    let keystore = KeyStore::default_location().context("failed to initialize keystore")?;

    let (fingerprint, public_pem) = keystore
        .generate(name)
        .with_context(|| format!("failed to generate key '{name}'"))?;

    info!(name, fingerprint = %fingerprint, "key generated");

    println!("Generated RSA key pair '{name}'");
    println!("  Fingerprint: {}", &fingerprint[..fingerprint.len().min(12)]);
    println!("  Stored in:   {}", keystore.base_dir().display());
    print!("{public_pem}");

    Ok(())
}
