//! Settings for the command line tool, read from an optional TOML file.
//!
//! ```toml
//! license_path = "/etc/myapp/license.dat"
//! clock_guard_path = "/var/lib/myapp/timestamp.dat"
//! rollback_tolerance_secs = 600
//!
//! [signing]
//! scheme = "hmac-sha256"          # or "rs512"
//! secret_env = "OFFLINE_LICENSE_SECRET"
//! # private_key_path = "issuer.pem"   (rs512, issuing)
//! # public_jwk_path = "issuer.jwk"    (rs512, verifying)
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde_derive::Deserialize;

use crate::clock_guard::DEFAULT_ROLLBACK_TOLERANCE_SECS;
use crate::error::{LicenseError, LicenseResult};
use crate::signature::{RsaSigner, RsaVerifier, SharedSecret, SignatureSigner, SignatureVerifier};

pub const DEFAULT_LICENSE_FILE: &str = "license.dat";
pub const DEFAULT_CLOCK_GUARD_FILE: &str = "timestamp.dat";
pub const DEFAULT_SECRET_ENV: &str = "OFFLINE_LICENSE_SECRET";

/// Upper bound for `rollback_tolerance_secs`: one year.
pub const MAX_ROLLBACK_TOLERANCE_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub license_path: PathBuf,
    pub clock_guard_path: PathBuf,
    pub rollback_tolerance_secs: i64,
    pub signing: SigningConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            license_path: PathBuf::from(DEFAULT_LICENSE_FILE),
            clock_guard_path: PathBuf::from(DEFAULT_CLOCK_GUARD_FILE),
            rollback_tolerance_secs: DEFAULT_ROLLBACK_TOLERANCE_SECS,
            signing: SigningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigningScheme {
    #[default]
    HmacSha256,
    Rs512,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SigningConfig {
    pub scheme: SigningScheme,
    /// Environment variable holding the shared secret; takes precedence over `secret`.
    pub secret_env: String,
    pub secret: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub public_jwk_path: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            scheme: SigningScheme::default(),
            secret_env: DEFAULT_SECRET_ENV.to_string(),
            secret: None,
            private_key_path: None,
            public_jwk_path: None,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> LicenseResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|e| LicenseError::io(path, e))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> LicenseResult<Self> {
        let settings: Self = toml::from_str(raw).map_err(|e| LicenseError::Config(e.to_string()))?;
        settings.rollback_tolerance()?;
        Ok(settings)
    }

    /// `rollback_tolerance_secs` as a duration, between zero and
    /// [`MAX_ROLLBACK_TOLERANCE_SECS`].
    pub fn rollback_tolerance(&self) -> LicenseResult<TimeDelta> {
        let secs = self.rollback_tolerance_secs;
        let out_of_range = || {
            LicenseError::Config(format!(
                "rollback_tolerance_secs {secs} is outside 0..={MAX_ROLLBACK_TOLERANCE_SECS}"
            ))
        };
        if !(0..=MAX_ROLLBACK_TOLERANCE_SECS).contains(&secs) {
            return Err(out_of_range());
        }
        TimeDelta::try_seconds(secs).ok_or_else(out_of_range)
    }
}

impl SigningConfig {
    /// The shared secret from the environment, else from the file.
    pub fn shared_secret(&self) -> LicenseResult<SharedSecret> {
        let secret = env::var(&self.secret_env)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.secret.clone().filter(|s| !s.is_empty()))
            .ok_or_else(|| {
                LicenseError::Config(format!(
                    "no shared secret: set {} or signing.secret",
                    self.secret_env
                ))
            })?;
        SharedSecret::new(secret)
    }

    pub fn signer(&self) -> LicenseResult<Box<dyn SignatureSigner>> {
        match self.scheme {
            SigningScheme::HmacSha256 => Ok(Box::new(self.shared_secret()?)),
            SigningScheme::Rs512 => {
                let path = self.private_key_path.as_deref().ok_or_else(|| {
                    LicenseError::Config("rs512 issuing needs signing.private_key_path".into())
                })?;
                let pem = fs::read_to_string(path).map_err(|e| LicenseError::io(path, e))?;
                Ok(Box::new(RsaSigner::from_pkcs8_pem(&pem)?))
            }
        }
    }

    pub fn verifier(&self) -> LicenseResult<Box<dyn SignatureVerifier>> {
        match self.scheme {
            SigningScheme::HmacSha256 => Ok(Box::new(self.shared_secret()?)),
            SigningScheme::Rs512 => {
                let path = self.public_jwk_path.as_deref().ok_or_else(|| {
                    LicenseError::Config("rs512 verification needs signing.public_jwk_path".into())
                })?;
                let raw = fs::read(path).map_err(|e| LicenseError::io(path, e))?;
                let jwk: serde_json::Value = serde_json::from_slice(&raw)
                    .map_err(|e| LicenseError::UnsupportedKey(e.to_string()))?;
                Ok(Box::new(RsaVerifier::from_jwk(jwk)?))
            }
        }
    }
}
