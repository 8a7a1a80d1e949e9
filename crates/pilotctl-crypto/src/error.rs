use crate::keystore::KeyKind;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("cannot find {0} key")]
    KeyNotFound(KeyKind),
    #[error("cannot load key: {0}")]
    LoadFailed(String),
    #[error("cannot store key: {0}")]
    WriteFailed(String),
    #[error("cannot sign payload: {0}")]
    SignFailed(String),
    #[error("signature verification failed: {0}")]
    VerifyFailed(String),
    #[error("wrong key kind: a {expected} key is required")]
    WrongKeyKind { expected: &'static str },
    #[error("serialization error: {0}")]
    Serialization(String),
}
