use ed25519_dalek::pkcs8::spki::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::debug;

use crate::CryptoError;

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

#[derive(Clone)]
enum Entity {
    Signing(SigningKey),
    Verifying(VerifyingKey),
}

/// A loaded signing or verification key.
#[derive(Clone)]
pub struct KeyMaterial {
    entity: Entity,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("has_private", &self.has_private())
            .finish()
    }
}

impl KeyMaterial {
    /// Parse an armored key ring and keep its first key.
    ///
    /// Blocks with unrecognised tags are skipped. Armor headers carry no
    /// meaning for Ed25519 keys and are ignored.
    pub fn from_armored(bytes: &[u8]) -> Result<Self, CryptoError> {
        let blocks = pem::parse_many(bytes)
            .map_err(|e| CryptoError::LoadFailed(format!("cannot read key ring: {e}")))?;

        let block = blocks
            .iter()
            .find(|b| b.tag() == PRIVATE_KEY_TAG || b.tag() == PUBLIC_KEY_TAG)
            .ok_or_else(|| CryptoError::LoadFailed("no key entities found".into()))?;

        let entity = if block.tag() == PRIVATE_KEY_TAG {
            SigningKey::from_pkcs8_der(block.contents())
                .map(Entity::Signing)
                .map_err(|e| CryptoError::LoadFailed(format!("invalid private key: {e}")))?
        } else {
            VerifyingKey::from_public_key_der(block.contents())
                .map(Entity::Verifying)
                .map_err(|e| CryptoError::LoadFailed(format!("invalid public key: {e}")))?
        };

        if block.headers().iter().next().is_some() {
            debug!(tag = block.tag(), "ignoring key armor headers");
        }

        Ok(Self { entity })
    }

    /// A fresh private key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut rand::thread_rng()))
    }

    /// Armored PKCS#8 private key. Requires a private key.
    pub fn private_armored(&self) -> Result<String, CryptoError> {
        let Entity::Signing(key) = &self.entity else {
            return Err(CryptoError::WrongKeyKind {
                expected: "private",
            });
        };
        let der = key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::LoadFailed(format!("cannot encode private key: {e}")))?;
        Ok(pem::encode(&pem::Pem::new(
            PRIVATE_KEY_TAG,
            der.as_bytes().to_vec(),
        )))
    }

    /// Armored SPKI public key.
    pub fn public_armored(&self) -> Result<String, CryptoError> {
        let der = self
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| CryptoError::LoadFailed(format!("cannot encode public key: {e}")))?;
        Ok(pem::encode(&pem::Pem::new(
            PUBLIC_KEY_TAG,
            der.as_bytes().to_vec(),
        )))
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        Self {
            entity: Entity::Signing(key),
        }
    }

    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self {
            entity: Entity::Verifying(key),
        }
    }

    /// Whether this material carries a private key.
    pub fn has_private(&self) -> bool {
        matches!(self.entity, Entity::Signing(_))
    }

    /// The public half, available for both kinds of material.
    pub fn verifying_key(&self) -> VerifyingKey {
        match &self.entity {
            Entity::Signing(key) => key.verifying_key(),
            Entity::Verifying(key) => *key,
        }
    }

    /// Sign raw bytes. Requires a private key.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, CryptoError> {
        match &self.entity {
            Entity::Signing(key) => Ok(key.sign(message)),
            Entity::Verifying(_) => Err(CryptoError::WrongKeyKind {
                expected: "private",
            }),
        }
    }

    /// Verify a signature over raw bytes. Requires a public-only key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        match &self.entity {
            Entity::Verifying(key) => key
                .verify(message, signature)
                .map_err(|e| CryptoError::VerifyFailed(e.to_string())),
            Entity::Signing(_) => Err(CryptoError::WrongKeyKind { expected: "public" }),
        }
    }
}
