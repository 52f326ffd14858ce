//! File-based RSA key storage for yardlink agents.
//!
//! Keys are stored at `~/.yardlink/keys/` by default:
//! - Private keys: `<name>.pem` (PKCS#1 PEM, mode 0600)
//! - Public keys: `<name>.pub` (SubjectPublicKeyInfo PEM)

use std::fs;
use std::path::{Path, PathBuf};

use yardlink_core::identity::{key_fingerprint, short_fingerprint, DEFAULT_KEY_BITS};
use yardlink_core::signing::Signer;
use yardlink_core::{YardError, YardResult};

/// Information about a stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Key name (filename stem).
    pub name: String,
    /// SHA-256 fingerprint of the DER public key (hex).
    pub fingerprint: String,
    /// Shortest prefix of `fingerprint` unique within the store.
    pub short_fingerprint: String,
    /// Public key PEM.
    pub public_key_pem: String,
}

/// File-based key store.
pub struct KeyStore {
    base_dir: PathBuf,
}

impl KeyStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Key store at the default location (`~/.yardlink/keys/`).
    pub fn default_location() -> YardResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| YardError::Other("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".yardlink").join("keys")))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn ensure_dir(&self) -> YardResult<()> {
        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.base_dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    fn private_key_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.pem"))
    }

    fn public_key_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.pub"))
    }

    fn check_name(name: &str) -> YardResult<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(YardError::Key(format!("invalid key name '{name}'")))
        }
    }

    /// Generate a new 2048-bit keypair and store it.
    ///
    /// Returns the fingerprint and public key PEM.
    pub fn generate(&self, name: &str) -> YardResult<(String, String)> {
        let signer = Signer::generate(DEFAULT_KEY_BITS)?;
        self.store(name, &signer)
    }

    /// Store an existing private key (PKCS#1 or PKCS#8 PEM).
    pub fn import(&self, name: &str, private_key_pem: &str) -> YardResult<(String, String)> {
        let signer = Signer::from_pem(private_key_pem)?;
        self.store(name, &signer)
    }

    fn store(&self, name: &str, signer: &Signer) -> YardResult<(String, String)> {
        Self::check_name(name)?;
        self.ensure_dir()?;

        if self.private_key_path(name).exists() {
            return Err(YardError::Key(format!("key '{name}' already exists")));
        }

        self.save_private_key(name, &signer.private_key_pem()?)?;
        let public_pem = signer.public_key_pem()?;
        fs::write(self.public_key_path(name), &public_pem)?;

        let fingerprint = key_fingerprint(signer.public_key())?;
        tracing::info!(%name, %fingerprint, "stored key");
        Ok((fingerprint, public_pem))
    }

    /// Load a signer by name.
    pub fn load(&self, name: &str) -> YardResult<Signer> {
        Self::check_name(name)?;
        let pem_path = self.private_key_path(name);
        if !pem_path.exists() {
            return Err(YardError::Key(format!("unknown key '{name}'")));
        }
        let pem = fs::read_to_string(&pem_path)?;
        Signer::from_pem(&pem)
    }

    /// List all stored keys, sorted by name.
    pub fn list(&self) -> YardResult<Vec<KeyInfo>> {
        self.ensure_dir()?;
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.describe(name) {
                Ok(info) => keys.push(info),
                Err(e) => tracing::warn!("skipping corrupt key '{}': {}", name, e),
            }
        }

        let all: Vec<String> = keys.iter().map(|k| k.fingerprint.clone()).collect();
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        for key in &mut keys {
            key.short_fingerprint = short_fingerprint(&key.fingerprint, &refs, 4);
        }

        keys.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(keys)
    }

    fn describe(&self, name: &str) -> YardResult<KeyInfo> {
        let signer = self.load(name)?;
        let fingerprint = key_fingerprint(signer.public_key())?;
        Ok(KeyInfo {
            name: name.to_string(),
            short_fingerprint: fingerprint.clone(),
            fingerprint,
            public_key_pem: signer.public_key_pem()?,
        })
    }

    pub fn delete(&self, name: &str) -> YardResult<()> {
        Self::check_name(name)?;
        let pem_path = self.private_key_path(name);
        let pub_path = self.public_key_path(name);

        if !pem_path.exists() {
            return Err(YardError::Key(format!("unknown key '{name}'")));
        }

        fs::remove_file(&pem_path)?;
        if pub_path.exists() {
            fs::remove_file(&pub_path)?;
        }
        Ok(())
    }

    /// Public key PEM, derived from the private key.
    pub fn export_public(&self, name: &str) -> YardResult<String> {
        self.load(name)?.public_key_pem()
    }

    fn save_private_key(&self, name: &str, pem: &str) -> YardResult<()> {
        let path = self.private_key_path(name);
        fs::write(&path, pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
