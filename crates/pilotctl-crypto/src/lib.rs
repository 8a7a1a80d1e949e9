mod canonical;
mod cipher;
mod envelope;
mod error;
mod keyring;
mod keystore;

pub use canonical::{canonicalize, checksum};
pub use cipher::{decrypt_key, encrypt_key};
pub use envelope::{sign, verify, EnvelopeSigner, SignedEnvelope};
pub use error::CryptoError;
pub use keyring::KeyMaterial;
pub use keystore::{generate_key_files, KeyKind, KeyLocation, KeySource, KeyStore};
