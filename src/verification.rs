use std::fs;
use std::path::Path;

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::clock_guard::ClockGuard;
use crate::error::{LicenseError, LicenseResult};
use crate::record::LicenseRecord;
use crate::signature::{verify_signature, SignatureVerifier};

/// Verifies persisted licenses against the current machine and application.
///
/// Checks run in this order and stop at the first failure, which decides
/// the error a doubly-invalid license reports:
///
/// 1. clock guard (`ClockRollbackDetected`)
/// 2. decode (`MalformedRecord`)
/// 3. machine id (`MachineMismatch`)
/// 4. application id (`ApplicationMismatch`)
/// 5. expiry (`LicenseExpired`)
/// 6. signature (`InvalidSignature`)
pub struct LicenseVerification<'a> {
    verifier: &'a dyn SignatureVerifier,
    clock: &'a dyn Clock,
    rollback_tolerance: Option<TimeDelta>,
}

impl<'a> LicenseVerification<'a> {
    pub fn new(verifier: &'a dyn SignatureVerifier, clock: &'a dyn Clock) -> Self {
        Self {
            verifier,
            clock,
            rollback_tolerance: None,
        }
    }

    /// Overrides the clock guard's tolerance for guards opened by
    /// [`LicenseVerification::verify_and_update`].
    pub fn with_rollback_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.rollback_tolerance = Some(tolerance);
        self
    }

    /// Verifies the license stored at `license_path`, using the clock-guard
    /// record at `clock_guard_path`.
    pub fn verify_and_update(
        &self,
        license_path: impl AsRef<Path>,
        clock_guard_path: impl AsRef<Path>,
        machine_id: &str,
        app_id: &str,
    ) -> LicenseResult<LicenseRecord> {
        let license_path = license_path.as_ref();
        let mut guard = ClockGuard::new(clock_guard_path.as_ref());
        if let Some(tolerance) = self.rollback_tolerance {
            guard = guard.with_tolerance(tolerance);
        }

        self.verify_from(&guard, machine_id, app_id, || {
            debug!(license_path = %license_path.display(), "loading license file");
            fs::read(license_path).map_err(|e| LicenseError::io(license_path, e))
        })
    }

    /// Like [`LicenseVerification::verify_and_update`] with the license
    /// already in memory.
    pub fn verify_bytes(
        &self,
        license: &[u8],
        guard: &ClockGuard,
        machine_id: &str,
        app_id: &str,
    ) -> LicenseResult<LicenseRecord> {
        self.verify_from(guard, machine_id, app_id, || Ok(license.to_vec()))
    }

    fn verify_from(
        &self,
        guard: &ClockGuard,
        machine_id: &str,
        app_id: &str,
        read_license: impl FnOnce() -> LicenseResult<Vec<u8>>,
    ) -> LicenseResult<LicenseRecord> {
        let result = self.run_checks(guard, machine_id, app_id, read_license);
        match &result {
            Ok(record) => info!(
                machine_id = %record.machine_id,
                app_id = %record.app_id,
                expiry_date = %record.expiry_date,
                "license verified"
            ),
            Err(error) => warn!(kind = error.kind(), %error, "license verification failed"),
        }
        result
    }

    fn run_checks(
        &self,
        guard: &ClockGuard,
        machine_id: &str,
        app_id: &str,
        read_license: impl FnOnce() -> LicenseResult<Vec<u8>>,
    ) -> LicenseResult<LicenseRecord> {
        guard.check_and_advance(self.clock)?;

        let record = LicenseRecord::decode(&read_license()?)?;

        if record.machine_id != machine_id {
            return Err(LicenseError::MachineMismatch {
                expected: record.machine_id,
                actual: machine_id.to_owned(),
            });
        }

        // An empty caller app id gets no special treatment; decoded records
        // never carry one, so it always mismatches.
        if record.app_id != app_id {
            return Err(LicenseError::ApplicationMismatch {
                expected: record.app_id,
                actual: app_id.to_owned(),
            });
        }

        if record.is_expired_at(self.clock.now()) {
            return Err(LicenseError::LicenseExpired {
                expired_at: record.expiry_date,
            });
        }

        if !verify_signature(&record, self.verifier) {
            return Err(LicenseError::InvalidSignature);
        }
        debug!("license signature verified");

        Ok(record)
    }
}

/// Verifies a license file against the system clock with the default
/// rollback tolerance.
pub fn verify_and_update(
    license_path: impl AsRef<Path>,
    clock_guard_path: impl AsRef<Path>,
    machine_id: &str,
    app_id: &str,
    verifier: &dyn SignatureVerifier,
) -> LicenseResult<LicenseRecord> {
    LicenseVerification::new(verifier, &SystemClock).verify_and_update(
        license_path,
        clock_guard_path,
        machine_id,
        app_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::signature::SharedSecret;

    use chrono::{DateTime, TimeZone, Utc};
    use lazy_static::lazy_static;

    lazy_static! {
        static ref SECRET: SharedSecret = SharedSecret::new("verification-secret").unwrap();
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 9, 30, 0).unwrap()
    }

    fn signed_bytes(clock: &FixedClock, days: i64) -> Vec<u8> {
        let mut record = LicenseRecord::issue("M1", "A1", days, vec![], clock).unwrap();
        record.sign(&*SECRET).unwrap();
        record.encode().unwrap()
    }

    fn expect_err(result: LicenseResult<LicenseRecord>) -> LicenseError {
        let Err(error) = result else {
            panic!("An error was expected")
        };
        error
    }

    #[test]
    fn valid_license_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(start());
        let guard = ClockGuard::new(dir.path().join("timestamp.dat"));
        let bytes = signed_bytes(&clock, 30);

        let verification = LicenseVerification::new(&*SECRET, &clock);
        let record = verification.verify_bytes(&bytes, &guard, "M1", "A1").unwrap();
        assert_eq!(record.machine_id, "M1");
        assert_eq!(guard.last_observed().unwrap(), Some(start()));
    }

    #[test]
    fn malformed_bytes_after_guard() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(start());
        let guard = ClockGuard::new(dir.path().join("timestamp.dat"));

        let verification = LicenseVerification::new(&*SECRET, &clock);
        let error = expect_err(verification.verify_bytes(b"{}", &guard, "M1", "A1"));
        assert!(matches!(error, LicenseError::MalformedRecord(_)));
        // The guard ran first.
        assert_eq!(guard.last_observed().unwrap(), Some(start()));
    }

    #[test]
    fn rollback_wins_over_every_other_failure() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(start());
        let guard = ClockGuard::new(dir.path().join("timestamp.dat"));
        guard.check_and_advance(&clock).unwrap();
        clock.advance(TimeDelta::hours(-1));

        let verification = LicenseVerification::new(&*SECRET, &clock);
        let error = expect_err(verification.verify_bytes(b"garbage", &guard, "M2", ""));
        assert!(matches!(error, LicenseError::ClockRollbackDetected { .. }));
    }

    #[test]
    fn machine_checked_before_app_before_expiry_before_signature() {
        let dir = tempfile::tempdir().unwrap();
        let issue_clock = FixedClock::new(start());
        let mut record = LicenseRecord::issue("M1", "A1", 1, vec![], &issue_clock).unwrap();
        record.sign(&*SECRET).unwrap();
        record.signature = Some("AAAA".into());
        let bytes = record.encode().unwrap();

        let clock = FixedClock::new(start() + TimeDelta::days(2));
        let guard = ClockGuard::new(dir.path().join("timestamp.dat"));
        let verification = LicenseVerification::new(&*SECRET, &clock);

        let error = expect_err(verification.verify_bytes(&bytes, &guard, "M2", "A2"));
        assert!(matches!(error, LicenseError::MachineMismatch { .. }));

        let error = expect_err(verification.verify_bytes(&bytes, &guard, "M1", "A2"));
        assert!(matches!(error, LicenseError::ApplicationMismatch { .. }));

        let error = expect_err(verification.verify_bytes(&bytes, &guard, "M1", "A1"));
        assert!(matches!(error, LicenseError::LicenseExpired { .. }));

        clock.set(start());
        let error = expect_err(verification.verify_bytes(&bytes, &guard, "M1", "A1"));
        // Clock went back two days: the guard trips before anything else.
        assert!(matches!(error, LicenseError::ClockRollbackDetected { .. }));

        let fresh_guard = ClockGuard::new(dir.path().join("fresh.dat"));
        let error = expect_err(verification.verify_bytes(&bytes, &fresh_guard, "M1", "A1"));
        assert!(matches!(error, LicenseError::InvalidSignature));
    }

    #[test]
    fn empty_app_id_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(start());
        let guard = ClockGuard::new(dir.path().join("timestamp.dat"));
        let bytes = signed_bytes(&clock, 30);

        let verification = LicenseVerification::new(&*SECRET, &clock);
        let error = expect_err(verification.verify_bytes(&bytes, &guard, "M1", ""));
        let LicenseError::ApplicationMismatch { expected, actual } = error else {
            panic!("unexpected error {error:?}")
        };
        assert_eq!(expected, "A1");
        assert_eq!(actual, "");
    }

    #[test]
    fn tolerance_override_applies_to_path_based_guards() {
        let dir = tempfile::tempdir().unwrap();
        let license_path = dir.path().join("license.dat");
        let guard_path = dir.path().join("timestamp.dat");
        let clock = FixedClock::new(start());
        fs::write(&license_path, signed_bytes(&clock, 30)).unwrap();

        let verification = LicenseVerification::new(&*SECRET, &clock)
            .with_rollback_tolerance(TimeDelta::minutes(1));
        verification
            .verify_and_update(&license_path, &guard_path, "M1", "A1")
            .unwrap();

        clock.advance(TimeDelta::minutes(-5));
        let error = expect_err(verification.verify_and_update(
            &license_path,
            &guard_path,
            "M1",
            "A1",
        ));
        assert!(matches!(error, LicenseError::ClockRollbackDetected { .. }));
    }

    #[test]
    fn missing_license_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(start());
        let verification = LicenseVerification::new(&*SECRET, &clock);

        let error = expect_err(verification.verify_and_update(
            dir.path().join("absent.dat"),
            dir.path().join("timestamp.dat"),
            "M1",
            "A1",
        ));
        assert!(matches!(error, LicenseError::Io { .. }));
    }

    #[test]
    fn free_function_uses_the_system_clock() {
        let dir = tempfile::tempdir().unwrap();
        let license_path = dir.path().join("license.dat");
        let guard_path = dir.path().join("timestamp.dat");
        let mut record = LicenseRecord::issue("M1", "A1", 1, vec![], &SystemClock).unwrap();
        record.sign(&*SECRET).unwrap();
        record.save(&license_path).unwrap();

        let before = Utc::now();
        let verified = verify_and_update(&license_path, &guard_path, "M1", "A1", &*SECRET).unwrap();
        assert_eq!(verified, record);
        let mark = ClockGuard::new(&guard_path).last_observed().unwrap().unwrap();
        assert!(mark >= before && mark <= Utc::now());

        let error = expect_err(verify_and_update(
            &license_path,
            &guard_path,
            "M2",
            "A1",
            &*SECRET,
        ));
        assert!(matches!(error, LicenseError::MachineMismatch { .. }));
    }
}
