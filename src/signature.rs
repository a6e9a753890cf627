//! Signing and verification of license records.
//!
//! The signature is always computed over
//! [`LicenseRecord::canonical_signing_payload`] and stored as standard base64
//! in the record's `signature` field.
//!
//! The default scheme is HMAC-SHA256 with a [`SharedSecret`]. It is a
//! symmetric scheme: whoever holds the secret to verify licenses can also
//! forge them. [`RsaSigner`] / [`RsaVerifier`] implement RS512 behind the
//! same traits for deployments that must not ship signing capability to the
//! verifying machines.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use jose_jwk::crypto::KeyInfo;
use jose_jwk::jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, Key};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha512};

use crate::error::{LicenseError, LicenseResult};
use crate::record::LicenseRecord;

type HmacSha256 = Hmac<Sha256>;

/// Checks raw signatures over canonical payload bytes.
pub trait SignatureVerifier {
    /// Must not panic; any failure is reported as `false`.
    fn verify_payload(&self, payload: &[u8], signature: &[u8]) -> bool;
}

/// Produces raw signatures over canonical payload bytes.
pub trait SignatureSigner: SignatureVerifier {
    fn sign_payload(&self, payload: &[u8]) -> LicenseResult<Vec<u8>>;
}

/// Signs `record` in place, replacing any previous signature.
pub fn sign(record: &mut LicenseRecord, signer: &dyn SignatureSigner) -> LicenseResult<()> {
    let payload = record.canonical_signing_payload()?;
    let signature = signer.sign_payload(&payload)?;
    record.signature = Some(BASE64.encode(signature));
    Ok(())
}

/// Whether `record` carries a valid signature for its current contents.
///
/// A missing signature or one that is not valid base64 is simply invalid.
pub fn verify_signature(record: &LicenseRecord, verifier: &dyn SignatureVerifier) -> bool {
    let Some(encoded) = record.signature.as_deref() else {
        return false;
    };
    let Ok(signature) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(payload) = record.canonical_signing_payload() else {
        return false;
    };
    verifier.verify_payload(&payload, &signature)
}

impl LicenseRecord {
    pub fn sign(&mut self, signer: &dyn SignatureSigner) -> LicenseResult<()> {
        sign(self, signer)
    }

    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> bool {
        verify_signature(self, verifier)
    }
}

/// HMAC-SHA256 key shared by issuer and verifier.
#[derive(Clone)]
pub struct SharedSecret {
    key: Vec<u8>,
}

impl SharedSecret {
    pub fn new(key: impl Into<Vec<u8>>) -> LicenseResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(LicenseError::InvalidInput(
                "shared secret cannot be empty".into(),
            ));
        }
        Ok(Self { key })
    }

    fn mac(&self) -> LicenseResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| LicenseError::Signing(e.to_string()))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier for SharedSecret {
    fn verify_payload(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(payload);
        // Constant-time comparison.
        mac.verify_slice(signature).is_ok()
    }
}

impl SignatureSigner for SharedSecret {
    fn sign_payload(&self, payload: &[u8]) -> LicenseResult<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// RS512 issuer holding the private key.
pub struct RsaSigner {
    signing_key: SigningKey<Sha512>,
    verifier: RsaVerifier,
}

impl RsaSigner {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let verifier = RsaVerifier::new(private_key.to_public_key());
        Self {
            signing_key: SigningKey::<Sha512>::new(private_key),
            verifier,
        }
    }

    /// Loads a PKCS#8 PEM encoded private key.
    pub fn from_pkcs8_pem(pem: &str) -> LicenseResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| LicenseError::UnsupportedKey(e.to_string()))?;
        Ok(Self::new(private_key))
    }

    /// The matching public-key verifier, safe to distribute.
    pub fn verifier(&self) -> RsaVerifier {
        self.verifier.clone()
    }
}

impl SignatureVerifier for RsaSigner {
    fn verify_payload(&self, payload: &[u8], signature: &[u8]) -> bool {
        self.verifier.verify_payload(payload, signature)
    }
}

impl SignatureSigner for RsaSigner {
    fn sign_payload(&self, payload: &[u8]) -> LicenseResult<Vec<u8>> {
        let signature = self
            .signing_key
            .try_sign(payload)
            .map_err(|e| LicenseError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }
}

/// RS512 verifier holding only the public key.
#[derive(Debug, Clone)]
pub struct RsaVerifier {
    rsa_public_key: RsaPublicKey,
}

impl RsaVerifier {
    pub fn new(rsa_public_key: RsaPublicKey) -> Self {
        Self { rsa_public_key }
    }

    /// Builds a verifier from an RSA public key in JWK form.
    ///
    /// Keys that cannot be used for RS512 (wrong type or too small) are
    /// rejected.
    pub fn from_jwk(public_key: serde_json::Value) -> LicenseResult<Self> {
        let parsed_public_key: Jwk = serde_json::from_value(public_key)
            .map_err(|_| LicenseError::UnsupportedKey("key is not a JWK".into()))?;

        if !parsed_public_key.is_supported(&Algorithm::from(Signing::Rs512)) {
            return Err(LicenseError::UnsupportedKey(
                "key does not support RS512".into(),
            ));
        }

        let Key::Rsa(jwk_rsa_key) = parsed_public_key.key else {
            return Err(LicenseError::UnsupportedKey("key is not an RSA key".into()));
        };
        let rsa_key = RsaPublicKey::try_from(&jwk_rsa_key)
            .map_err(|_| LicenseError::UnsupportedKey("invalid RSA public key".into()))?;

        Ok(Self::new(rsa_key))
    }
}

impl SignatureVerifier for RsaVerifier {
    fn verify_payload(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(rsa_signature) = Signature::try_from(signature) else {
            return false;
        };
        let verifying_key = VerifyingKey::<Sha512>::new(self.rsa_public_key.clone());
        verifying_key.verify(payload, &rsa_signature).is_ok()
    }
}
