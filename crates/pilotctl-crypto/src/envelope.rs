use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::{checksum, CryptoError, KeyMaterial, KeyStore};

const SIGNATURE_TAG: &str = "SIGNATURE";

/// Sign the checksum of a payload's canonical form.
///
/// The detached signature is armored and the armor is returned base64
/// encoded.
pub fn sign<T: Serialize + ?Sized>(payload: &T, key: &KeyMaterial) -> Result<String, CryptoError> {
    if !key.has_private() {
        return Err(CryptoError::WrongKeyKind {
            expected: "private",
        });
    }
    let sum = checksum(payload).map_err(|e| CryptoError::SignFailed(e.to_string()))?;
    let signature = key.sign(&sum)?;
    let armored = pem::encode(&pem::Pem::new(SIGNATURE_TAG, signature.to_bytes().to_vec()));
    Ok(STANDARD.encode(armored))
}

/// Check a signature produced by [`sign`] against a public-only key.
pub fn verify<T: Serialize + ?Sized>(
    payload: &T,
    signature: &str,
    key: &KeyMaterial,
) -> Result<(), CryptoError> {
    if key.has_private() {
        return Err(CryptoError::WrongKeyKind { expected: "public" });
    }
    let armored = STANDARD
        .decode(signature)
        .map_err(|e| CryptoError::VerifyFailed(format!("cannot decode signature: {e}")))?;
    let block = pem::parse(&armored)
        .map_err(|e| CryptoError::VerifyFailed(format!("cannot read signature armor: {e}")))?;
    if block.tag() != SIGNATURE_TAG {
        return Err(CryptoError::VerifyFailed(format!(
            "unexpected armor block {}",
            block.tag()
        )));
    }
    let signature = Signature::from_slice(block.contents())
        .map_err(|e| CryptoError::VerifyFailed(e.to_string()))?;
    let sum = checksum(payload).map_err(|e| CryptoError::VerifyFailed(e.to_string()))?;
    key.verify(&sum, &signature)
}

/// Signs payloads with the signing key currently held by a [`KeyStore`].
#[derive(Clone, Debug)]
pub struct EnvelopeSigner {
    keys: KeyStore,
}

impl EnvelopeSigner {
    pub fn new(keys: KeyStore) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Load the signing key and sign. The key is read fresh on every call.
    pub fn sign<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, CryptoError> {
        let key = self.keys.signing_key()?;
        sign(payload, &key)
    }
}

/// A payload together with its detached signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope<T> {
    pub signature: String,
    #[serde(rename = "envelope")]
    pub payload: T,
}

impl<T: Serialize> SignedEnvelope<T> {
    /// Sign a payload. Fails without producing an envelope if signing fails.
    pub fn seal(payload: T, signer: &EnvelopeSigner) -> Result<Self, CryptoError> {
        let signature = signer.sign(&payload)?;
        Ok(Self { signature, payload })
    }

    pub fn verify(&self, key: &KeyMaterial) -> Result<(), CryptoError> {
        verify(&self.payload, &self.signature, key)
    }

    /// Verify and hand back the payload.
    pub fn open(self, key: &KeyMaterial) -> Result<T, CryptoError> {
        self.verify(key)?;
        Ok(self.payload)
    }
}
