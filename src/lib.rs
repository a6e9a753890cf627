//! Issuing and offline verification of machine-bound, time-limited licenses.
//!
//! A license is a JSON document binding a machine id and an application id
//! to an expiry date, signed over a canonical serialization of its fields.
//! Verification needs no network: it checks the local clock has not been
//! rolled back, then the bindings, the expiry and the signature.
//!
//! ```no_run
//! use offline_license::{LicenseRecord, LicenseVerification, SharedSecret, SystemClock};
//!
//! # fn main() -> Result<(), offline_license::LicenseError> {
//! let secret = SharedSecret::new("shared secret")?;
//!
//! let mut license = LicenseRecord::issue("M1", "A1", 30, vec!["export".into()], &SystemClock)?;
//! license.sign(&secret)?;
//! license.save("license.dat")?;
//!
//! LicenseVerification::new(&secret, &SystemClock)
//!     .verify_and_update("license.dat", "timestamp.dat", "M1", "A1")?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod clock_guard;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod record;
pub mod signature;
pub mod verification;

mod persist;

pub use clock::{Clock, FixedClock, SystemClock};
pub use clock_guard::{ClockGuard, ClockGuardRecord, DEFAULT_ROLLBACK_TOLERANCE_SECS};
pub use error::{LicenseError, LicenseResult};
pub use fingerprint::{FingerprintSource, HostFingerprint, StaticFingerprint};
pub use record::LicenseRecord;
pub use signature::{
    sign, verify_signature, RsaSigner, RsaVerifier, SharedSecret, SignatureSigner,
    SignatureVerifier,
};
pub use verification::{verify_and_update, LicenseVerification};
