//! The license record, its JSON codec and the canonical bytes it is signed over.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use crate::persist;

/// A license binding one machine and one application to an expiry date.
///
/// Records are created by [`LicenseRecord::issue`], signed once and then
/// treated as immutable: changing any field afterwards makes signature
/// verification fail.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LicenseRecord {
    pub machine_id: String,
    pub app_id: String,
    pub expiry_date: DateTime<Utc>,
    /// Feature tags. Semantically a set; order carries no meaning.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    /// Base64 signature over [`LicenseRecord::canonical_signing_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub creation_date: DateTime<Utc>,
}

/// The signed view of a record: every field except the signature, features
/// sorted and de-duplicated.
#[derive(Serialize)]
struct SigningPayload<'a> {
    machine_id: &'a str,
    app_id: &'a str,
    expiry_date: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    features: BTreeSet<&'a str>,
    creation_date: &'a DateTime<Utc>,
}

impl LicenseRecord {
    /// Creates an unsigned license valid for `valid_days` whole days from now.
    ///
    /// Days are counted as 24 hour periods in UTC, so the expiry never
    /// depends on the issuer's local timezone or DST transitions.
    pub fn issue(
        machine_id: impl Into<String>,
        app_id: impl Into<String>,
        valid_days: i64,
        features: Vec<String>,
        clock: &dyn Clock,
    ) -> LicenseResult<Self> {
        let machine_id = machine_id.into();
        let app_id = app_id.into();

        if machine_id.is_empty() {
            return Err(LicenseError::InvalidInput(
                "machine id cannot be empty".into(),
            ));
        }
        if app_id.is_empty() {
            return Err(LicenseError::InvalidInput("app id cannot be empty".into()));
        }
        if valid_days <= 0 {
            return Err(LicenseError::InvalidInput(format!(
                "validity must be at least one day, got {valid_days}"
            )));
        }
        if features.iter().any(String::is_empty) {
            return Err(LicenseError::InvalidInput(
                "feature tags cannot be empty".into(),
            ));
        }

        let creation_date = clock.now();
        let expiry_date = TimeDelta::try_days(valid_days)
            .and_then(|validity| creation_date.checked_add_signed(validity))
            .ok_or_else(|| {
                LicenseError::InvalidInput(format!("validity of {valid_days} days is out of range"))
            })?;

        Ok(Self {
            machine_id,
            app_id,
            expiry_date,
            features,
            signature: None,
            creation_date,
        })
    }

    /// Serializes the record, signature included, as compact JSON.
    pub fn encode(&self) -> LicenseResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LicenseError::MalformedRecord(e.to_string()))
    }

    /// Parses a record previously produced by [`LicenseRecord::encode`].
    ///
    /// Structural problems (invalid JSON, missing or unknown fields, bad
    /// timestamps, empty identifiers or feature tags) are rejected here,
    /// before any signature check is attempted.
    pub fn decode(bytes: &[u8]) -> LicenseResult<Self> {
        let record: Self = serde_json::from_slice(bytes)
            .map_err(|e| LicenseError::MalformedRecord(e.to_string()))?;

        if record.machine_id.is_empty() {
            return Err(LicenseError::MalformedRecord("empty machine_id".into()));
        }
        if record.app_id.is_empty() {
            return Err(LicenseError::MalformedRecord("empty app_id".into()));
        }
        if record.features.iter().any(String::is_empty) {
            return Err(LicenseError::MalformedRecord("empty feature tag".into()));
        }

        Ok(record)
    }

    /// The exact bytes the signature is computed over.
    ///
    /// JSON with fields in the order `machine_id`, `app_id`, `expiry_date`,
    /// `features` (sorted, omitted when empty), `creation_date`. The
    /// signature never takes part, whether it is set or not.
    pub fn canonical_signing_payload(&self) -> LicenseResult<Vec<u8>> {
        let payload = SigningPayload {
            machine_id: &self.machine_id,
            app_id: &self.app_id,
            expiry_date: &self.expiry_date,
            features: self.features.iter().map(String::as_str).collect(),
            creation_date: &self.creation_date,
        };
        serde_json::to_vec(&payload).map_err(|e| LicenseError::MalformedRecord(e.to_string()))
    }

    /// Writes the encoded record to `path`, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> LicenseResult<()> {
        let path = path.as_ref();
        let bytes = self.encode()?;
        persist::write_atomic(path, &bytes)?;
        debug!(license_path = %path.display(), "license saved");
        Ok(())
    }

    /// Reads and decodes a record from `path`.
    pub fn load(path: impl AsRef<Path>) -> LicenseResult<Self> {
        let path = path.as_ref();
        debug!(license_path = %path.display(), "loading license file");
        let bytes = fs::read(path).map_err(|e| LicenseError::io(path, e))?;
        Self::decode(&bytes)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    /// Whether the license is no longer valid at `now`. The expiry instant
    /// itself is still valid.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    use chrono::TimeZone;
    use lazy_static::lazy_static;

    lazy_static! {
        static ref ISSUED_AT: DateTime<Utc> = Utc
            .with_ymd_and_hms(2024, 3, 30, 22, 15, 0)
            .unwrap()
            + TimeDelta::nanoseconds(123_456_789);
    }

    fn issue(features: &[&str]) -> LicenseRecord {
        LicenseRecord::issue(
            "M1",
            "A1",
            30,
            features.iter().map(|f| f.to_string()).collect(),
            &FixedClock::new(*ISSUED_AT),
        )
        .expect("issuance should work")
    }

    #[test]
    fn issue_sets_dates_in_utc_days() {
        let record = issue(&["export"]);
        assert_eq!(record.creation_date, *ISSUED_AT);
        // Crosses the EU DST switch; still exactly 30 * 24h.
        assert_eq!(record.expiry_date - record.creation_date, TimeDelta::days(30));
        assert_eq!(record.signature, None);
        assert!(record.has_feature("export"));
        assert!(!record.has_feature("import"));
    }

    #[test]
    fn issue_rejects_bad_parameters() {
        let clock = FixedClock::new(*ISSUED_AT);
        let cases = [
            LicenseRecord::issue("", "A1", 30, vec![], &clock),
            LicenseRecord::issue("M1", "", 30, vec![], &clock),
            LicenseRecord::issue("M1", "A1", 0, vec![], &clock),
            LicenseRecord::issue("M1", "A1", -3, vec![], &clock),
            LicenseRecord::issue("M1", "A1", i64::MAX, vec![], &clock),
            LicenseRecord::issue("M1", "A1", 30, vec!["".into()], &clock),
        ];
        for case in cases {
            let Err(error) = case else {
                panic!("An error was expected")
            };
            assert!(matches!(error, LicenseError::InvalidInput(_)), "{error:?}");
        }
    }

    #[test]
    fn round_trip_is_lossless() {
        let mut with_features = issue(&["b", "a"]);
        with_features.signature = Some("c2lnbmF0dXJl".into());
        let without_features = issue(&[]);

        for record in [with_features, without_features] {
            let decoded = LicenseRecord::decode(&record.encode().unwrap()).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(decoded.creation_date.timestamp_subsec_nanos(), 123_456_789);
        }
    }

    #[test]
    fn encoding_uses_wire_field_names() {
        let mut record = issue(&[]);
        record.signature = Some("c2ln".into());
        let value: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();

        assert_eq!(value["machine_id"], "M1");
        assert_eq!(value["app_id"], "A1");
        assert_eq!(value["signature"], "c2ln");
        assert_eq!(value["creation_date"], "2024-03-30T22:15:00.123456789Z");
        assert!(value.get("features").is_none());
    }

    #[test]
    fn decode_accepts_offsets_and_missing_features() {
        let json = serde_json::json!({
            "machine_id": "M1",
            "app_id": "A1",
            "expiry_date": "2030-01-01T02:00:00+02:00",
            "signature": "c2ln",
            "creation_date": "2029-12-01T00:00:00Z"
        });
        let record = LicenseRecord::decode(json.to_string().as_bytes()).unwrap();
        assert_eq!(
            record.expiry_date,
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(record.features.is_empty());
    }

    #[test]
    fn decode_rejects_structurally_invalid_input() {
        let inputs = [
            "".to_string(),
            "not json".to_string(),
            serde_json::json!({"random": "ABC", "someOtherField": 123456}).to_string(),
            serde_json::json!({
                "machine_id": "M1",
                "app_id": "A1",
                "expiry_date": "tomorrow",
                "creation_date": "2029-12-01T00:00:00Z"
            })
            .to_string(),
            serde_json::json!({
                "machine_id": "",
                "app_id": "A1",
                "expiry_date": "2030-01-01T00:00:00Z",
                "creation_date": "2029-12-01T00:00:00Z"
            })
            .to_string(),
            serde_json::json!({
                "machine_id": "M1",
                "app_id": "A1",
                "expiry_date": "2030-01-01T00:00:00Z",
                "creation_date": "2029-12-01T00:00:00Z",
                "max_seats": 10
            })
            .to_string(),
            serde_json::json!({
                "machine_id": "M1",
                "app_id": "A1",
                "expiry_date": "2030-01-01T00:00:00Z",
                "features": ["export", ""],
                "creation_date": "2029-12-01T00:00:00Z"
            })
            .to_string(),
        ];
        for input in inputs {
            let Err(error) = LicenseRecord::decode(input.as_bytes()) else {
                panic!("An error was expected for {input}")
            };
            assert!(matches!(error, LicenseError::MalformedRecord(_)), "{error:?}");
        }
    }

    #[test]
    fn signing_payload_ignores_signature_and_feature_order() {
        let mut record = issue(&["b", "a", "b"]);
        let unsigned = record.canonical_signing_payload().unwrap();

        record.signature = Some("c2ln".into());
        assert_eq!(record.canonical_signing_payload().unwrap(), unsigned);

        record.features = vec!["a".into(), "b".into()];
        assert_eq!(record.canonical_signing_payload().unwrap(), unsigned);

        let text = String::from_utf8(unsigned).unwrap();
        assert_eq!(
            text,
            "{\"machine_id\":\"M1\",\"app_id\":\"A1\",\
             \"expiry_date\":\"2024-04-29T22:15:00.123456789Z\",\
             \"features\":[\"a\",\"b\"],\
             \"creation_date\":\"2024-03-30T22:15:00.123456789Z\"}"
        );
    }

    #[test]
    fn save_and_load_through_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("license.dat");
        let record = issue(&["export"]);

        record.save(&path).unwrap();
        assert_eq!(LicenseRecord::load(&path).unwrap(), record);
    }

    #[test]
    fn load_reports_missing_file_as_io() {
        let dir = tempfile::tempdir().unwrap();
        let Err(error) = LicenseRecord::load(dir.path().join("absent.dat")) else {
            panic!("An error was expected")
        };
        assert!(matches!(error, LicenseError::Io { .. }), "{error:?}");
    }

    #[test]
    fn expiry_instant_is_still_valid() {
        let record = issue(&[]);
        assert!(!record.is_expired_at(record.expiry_date));
        assert!(record.is_expired_at(record.expiry_date + TimeDelta::nanoseconds(1)));
    }
}
