use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{cipher, CryptoError, KeyMaterial};

/// Which half of the service key pair is wanted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Sign,
    Verify,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Sign => "sign",
            KeyKind::Verify => "verify",
        }
    }

    /// File name looked up in every directory source, e.g. `.pilot_sign.pem`.
    pub fn file_name(&self) -> String {
        format!(".pilot_{}.pem", self.as_str())
    }

    fn env_suffix(&self) -> &'static str {
        match self {
            KeyKind::Sign => "SIGN_KEY",
            KeyKind::Verify => "VERIFY_KEY",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A place key material may come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource {
    /// A directory holding `KeyKind::file_name()` files.
    Dir(PathBuf),
    /// An environment variable prefix; `<prefix>_SIGN_KEY` holds armored
    /// key text for signing, `<prefix>_VERIFY_KEY` for verification.
    Env(String),
}

/// Where a key was found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyLocation {
    File(PathBuf),
    Env(String),
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyLocation::File(path) => write!(f, "{}", path.display()),
            KeyLocation::Env(var) => write!(f, "${var}"),
        }
    }
}

/// Ordered key lookup.
///
/// Sources are fixed at construction; key files are read again on every
/// load so a rotated key is picked up without a restart.
#[derive(Clone, Debug)]
pub struct KeyStore {
    sources: Vec<KeySource>,
    passphrase: Option<String>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(Self::default_sources())
    }
}

impl KeyStore {
    pub fn new(sources: Vec<KeySource>) -> Self {
        Self {
            sources,
            passphrase: None,
        }
    }

    /// Passphrase protecting the signing key file.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        let passphrase = passphrase.into();
        self.passphrase = (!passphrase.is_empty()).then_some(passphrase);
        self
    }

    /// Executable directory, then home directory, then `/keys`.
    pub fn default_sources() -> Vec<KeySource> {
        let mut sources = Vec::new();
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            sources.push(KeySource::Dir(dir));
        }
        if let Some(home) = std::env::var_os("HOME") {
            sources.push(KeySource::Dir(PathBuf::from(home)));
        }
        sources.push(KeySource::Dir(PathBuf::from("/keys")));
        sources
    }

    pub fn sources(&self) -> &[KeySource] {
        &self.sources
    }

    /// First source holding a key of the given kind.
    pub fn resolve(&self, kind: KeyKind) -> Result<KeyLocation, CryptoError> {
        for source in &self.sources {
            match source {
                KeySource::Dir(dir) => {
                    let path = dir.join(kind.file_name());
                    if path.exists() {
                        return Ok(KeyLocation::File(path));
                    }
                }
                KeySource::Env(prefix) => {
                    let var = format!("{prefix}_{}", kind.env_suffix());
                    if std::env::var_os(&var).is_some_and(|v| !v.is_empty()) {
                        return Ok(KeyLocation::Env(var));
                    }
                }
            }
        }
        Err(CryptoError::KeyNotFound(kind))
    }

    /// Read and parse key material, decrypting first when a passphrase is set.
    pub fn load(
        location: &KeyLocation,
        passphrase: Option<&str>,
    ) -> Result<KeyMaterial, CryptoError> {
        let bytes = Self::read(location)?;
        match passphrase {
            Some(passphrase) if !passphrase.is_empty() => {
                let plain = cipher::decrypt_key(&bytes, passphrase)?;
                KeyMaterial::from_armored(&plain)
            }
            _ => KeyMaterial::from_armored(&bytes),
        }
    }

    /// Raw bytes at a location, exactly as stored.
    pub fn read(location: &KeyLocation) -> Result<Vec<u8>, CryptoError> {
        match location {
            KeyLocation::File(path) => std::fs::read(path).map_err(|e| {
                CryptoError::LoadFailed(format!("cannot open key file {}: {e}", path.display()))
            }),
            KeyLocation::Env(var) => std::env::var(var)
                .map(String::into_bytes)
                .map_err(|e| CryptoError::LoadFailed(format!("cannot read ${var}: {e}"))),
        }
    }

    /// Resolve and load the private signing key.
    pub fn signing_key(&self) -> Result<KeyMaterial, CryptoError> {
        let location = self.resolve(KeyKind::Sign)?;
        debug!(%location, "loading signing key");
        let material = Self::load(&location, self.passphrase.as_deref())?;
        if !material.has_private() {
            return Err(CryptoError::WrongKeyKind {
                expected: "private",
            });
        }
        Ok(material)
    }

    /// Resolve and load the public verification key.
    pub fn verification_key(&self) -> Result<KeyMaterial, CryptoError> {
        let location = self.resolve(KeyKind::Verify)?;
        debug!(%location, "loading verification key");
        let material = Self::load(&location, None)?;
        if material.has_private() {
            return Err(CryptoError::WrongKeyKind { expected: "public" });
        }
        Ok(material)
    }

    /// Armored verification key text, as published to pilots.
    pub fn verification_key_armored(&self) -> Result<String, CryptoError> {
        let location = self.resolve(KeyKind::Verify)?;
        let bytes = Self::read(&location)?;
        if KeyMaterial::from_armored(&bytes)?.has_private() {
            return Err(CryptoError::WrongKeyKind { expected: "public" });
        }
        String::from_utf8(bytes)
            .map_err(|_| CryptoError::LoadFailed("verification key is not text".into()))
    }
}

/// Write a fresh key pair into `dir` under the standard file names.
///
/// With a passphrase the signing key is stored encrypted. Existing key
/// files are never overwritten, and on unix the signing key is readable by
/// its owner only.
pub fn generate_key_files(
    dir: &Path,
    passphrase: Option<&str>,
) -> Result<(PathBuf, PathBuf), CryptoError> {
    let sign_path = dir.join(KeyKind::Sign.file_name());
    let verify_path = dir.join(KeyKind::Verify.file_name());

    let key = KeyMaterial::generate();
    let private = match passphrase.filter(|p| !p.is_empty()) {
        Some(passphrase) => {
            cipher::encrypt_key(key.private_armored()?.as_bytes(), passphrase, rand::random())?
        }
        None => key.private_armored()?,
    };
    let public = key.public_armored()?;

    write_new_key(&sign_path, &private, 0o600)?;
    if let Err(e) = write_new_key(&verify_path, &public, 0o644) {
        // Do not leave half a pair behind.
        let _ = std::fs::remove_file(&sign_path);
        return Err(e);
    }
    Ok((sign_path, verify_path))
}

/// Create `path` exclusively and write `contents` to it.
fn write_new_key(path: &Path, contents: &str, mode: u32) -> Result<(), CryptoError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            CryptoError::WriteFailed(format!("{} already exists", path.display()))
        } else {
            CryptoError::WriteFailed(format!("cannot create {}: {e}", path.display()))
        }
    })?;
    file.write_all(contents.as_bytes())
        .map_err(|e| CryptoError::WriteFailed(format!("cannot write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt_key;
    use crate::keyring::tests::armored_pair;

    fn write_pair(dir: &Path) -> (String, String) {
        let (private, public) = armored_pair();
        std::fs::write(dir.join(KeyKind::Sign.file_name()), &private).unwrap();
        std::fs::write(dir.join(KeyKind::Verify.file_name()), &public).unwrap();
        (private, public)
    }

    #[test]
    fn resolves_first_existing_source() {
        let empty = tempfile::tempdir().unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_pair(first.path());
        write_pair(second.path());

        let store = KeyStore::new(vec![
            KeySource::Dir(empty.path().to_path_buf()),
            KeySource::Dir(first.path().to_path_buf()),
            KeySource::Dir(second.path().to_path_buf()),
        ]);
        assert_eq!(
            store.resolve(KeyKind::Sign).unwrap(),
            KeyLocation::File(first.path().join(".pilot_sign.pem"))
        );
    }

    #[test]
    fn not_found_when_no_source_matches() {
        let empty = tempfile::tempdir().unwrap();
        let store = KeyStore::new(vec![KeySource::Dir(empty.path().to_path_buf())]);
        assert!(matches!(
            store.resolve(KeyKind::Verify),
            Err(CryptoError::KeyNotFound(KeyKind::Verify))
        ));
    }

    #[test]
    fn loads_each_kind() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path());
        let store = KeyStore::new(vec![KeySource::Dir(dir.path().to_path_buf())]);

        let signing = store.signing_key().unwrap();
        let verifying = store.verification_key().unwrap();
        assert!(signing.has_private());
        assert_eq!(signing.verifying_key(), verifying.verifying_key());
    }

    #[test]
    fn public_key_in_sign_slot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, public) = armored_pair();
        std::fs::write(dir.path().join(KeyKind::Sign.file_name()), public).unwrap();
        let store = KeyStore::new(vec![KeySource::Dir(dir.path().to_path_buf())]);
        assert!(matches!(
            store.signing_key(),
            Err(CryptoError::WrongKeyKind { .. })
        ));
    }

    #[test]
    fn private_key_in_verify_slot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (private, _) = armored_pair();
        std::fs::write(dir.path().join(KeyKind::Verify.file_name()), private).unwrap();
        let store = KeyStore::new(vec![KeySource::Dir(dir.path().to_path_buf())]);
        assert!(matches!(
            store.verification_key(),
            Err(CryptoError::WrongKeyKind { .. })
        ));
    }

    #[test]
    fn passphrase_protected_signing_key() {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = armored_pair();
        let protected = encrypt_key(private.as_bytes(), "hunter2", [3u8; 16]).unwrap();
        std::fs::write(dir.path().join(KeyKind::Sign.file_name()), protected).unwrap();
        std::fs::write(dir.path().join(KeyKind::Verify.file_name()), public).unwrap();

        let store =
            KeyStore::new(vec![KeySource::Dir(dir.path().to_path_buf())]).with_passphrase("hunter2");
        let signing = store.signing_key().unwrap();
        let plain = KeyMaterial::from_armored(private.as_bytes()).unwrap();
        assert_eq!(signing.verifying_key(), plain.verifying_key());
    }

    #[test]
    fn env_source() {
        let (_, public) = armored_pair();
        std::env::set_var("PILOTCTL_KEYSTORE_TEST_VERIFY_KEY", &public);
        let store = KeyStore::new(vec![KeySource::Env("PILOTCTL_KEYSTORE_TEST".into())]);
        let location = store.resolve(KeyKind::Verify).unwrap();
        assert_eq!(
            location,
            KeyLocation::Env("PILOTCTL_KEYSTORE_TEST_VERIFY_KEY".into())
        );
        assert!(!store.verification_key().unwrap().has_private());
        assert!(store.resolve(KeyKind::Sign).is_err());
    }

    #[test]
    fn generated_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let (sign_path, verify_path) = generate_key_files(dir.path(), Some("hunter2")).unwrap();
        assert!(sign_path.ends_with(".pilot_sign.pem"));
        assert!(verify_path.ends_with(".pilot_verify.pem"));

        let store =
            KeyStore::new(vec![KeySource::Dir(dir.path().to_path_buf())]).with_passphrase("hunter2");
        let signing = store.signing_key().unwrap();
        assert_eq!(
            signing.verifying_key(),
            store.verification_key().unwrap().verifying_key()
        );
    }

    #[test]
    fn generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        generate_key_files(dir.path(), None).unwrap();
        assert!(matches!(
            generate_key_files(dir.path(), None),
            Err(CryptoError::WriteFailed(_))
        ));
    }

    #[test]
    fn existing_verification_key_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let verify_path = dir.path().join(".pilot_verify.pem");
        std::fs::write(&verify_path, "operator's key").unwrap();

        let err = generate_key_files(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");
        assert_eq!(std::fs::read_to_string(&verify_path).unwrap(), "operator's key");
        assert!(!dir.path().join(".pilot_sign.pem").exists());
    }

    #[test]
    fn existing_signing_key_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let sign_path = dir.path().join(".pilot_sign.pem");
        std::fs::write(&sign_path, "operator's key").unwrap();

        assert!(generate_key_files(dir.path(), None).is_err());
        assert_eq!(std::fs::read_to_string(&sign_path).unwrap(), "operator's key");
        assert!(!dir.path().join(".pilot_verify.pem").exists());
    }

    #[cfg(unix)]
    #[test]
    fn signing_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (sign_path, _) = generate_key_files(dir.path(), None).unwrap();
        let mode = std::fs::metadata(sign_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_file_is_load_error() {
        let location = KeyLocation::File(PathBuf::from("/nonexistent/.pilot_sign.pem"));
        assert!(matches!(
            KeyStore::load(&location, None),
            Err(CryptoError::LoadFailed(_))
        ));
    }
}
