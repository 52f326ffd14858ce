//! `yardlink keys`: list stored key pairs.

use anyhow::{Context, Result};

use yardlink_client::KeyStore;

pub async fn run() -> Result<()> {
    let keystore = KeyStore::default_location().context("failed to initialize keystore")?;
    let keys = keystore.list().context("failed to list keys")?;

    if keys.is_empty() {
        println!("No keys found. Run `yardlink keygen` to generate a key pair.");
        return Ok(());
    }

    println!("{:<16} {:<14} {}", "NAME", "FINGERPRINT", "AGENT UUID");
    for key in &keys {
        println!(
            "{:<16} {:<14} {}",
            key.name,
            key.short_fingerprint,
            super::uuid_from_fingerprint(&key.fingerprint)
        );
    }
    println!("\n{} key(s) found.", keys.len());

    Ok(())
}
