//! Session state of an API key.
//!
//! A [`SessionState`] holds everything the pipeline needs to decide about a
//! key: leaky-bucket parameters, quota counters, expiry and access rights. It
//! is stored as JSON under the key's token and rewritten after every request.
//!
//! # Wire format
//!
//! | Field                | Encoding                                |
//! |----------------------|-----------------------------------------|
//! | `last_check`         | Unix nanoseconds                        |
//! | `expires`            | Unix seconds, `0` for never             |
//! | `quota_renews`       | Unix seconds                            |
//! | `quota_renewal_rate` | seconds                                 |
//! | `rate`, `per`, `allowance` | JSON numbers, round-tripped exactly |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quota value meaning "no quota".
pub const UNLIMITED_QUOTA: i64 = -1;

/// One API a key may call, and the versions it may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDefinition {
    /// Informational API name.
    #[serde(default)]
    pub api_name: String,
    /// API identifier.
    pub api_id: String,
    /// Permitted version names.
    #[serde(default)]
    pub versions: Vec<String>,
}

impl AccessDefinition {
    /// Creates a grant for `api_id` limited to `versions`.
    #[must_use]
    pub fn new(
        api_id: impl Into<String>,
        api_name: impl Into<String>,
        versions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            api_name: api_name.into(),
            api_id: api_id.into(),
            versions: versions.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `version` is among the permitted versions.
    #[must_use]
    pub fn allows_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }
}

/// Persisted state of one API key.
///
/// ```
/// use tollgate_gateway::SessionState;
///
/// let session = SessionState::builder().rate(100.0).per(1.0).allowance(100.0).build();
/// assert!(session.has_unlimited_quota());
/// assert!(session.expires.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
pub struct SessionState {
    /// Last time the leaky bucket was refilled.
    #[serde(with = "chrono::serde::ts_nanoseconds")]
    #[builder(default = Utc::now())]
    pub last_check: DateTime<Utc>,

    /// Current bucket fill level, in `[0, rate]`.
    pub allowance: f64,

    /// Events allowed per `per` seconds.
    pub rate: f64,

    /// Length of the rate period in seconds.
    pub per: f64,

    /// Absolute expiry; `None` never expires.
    #[serde(default, with = "unix_or_never")]
    pub expires: Option<DateTime<Utc>>,

    /// Requests per renewal period, or [`UNLIMITED_QUOTA`].
    #[builder(default = UNLIMITED_QUOTA)]
    pub quota_max: i64,

    /// Requests left in the current period.
    #[serde(default)]
    #[builder(default)]
    pub quota_remaining: i64,

    /// When the quota resets next.
    #[serde(with = "chrono::serde::ts_seconds")]
    #[builder(default = Utc::now())]
    pub quota_renews: DateTime<Utc>,

    /// Renewal period in seconds.
    #[serde(default)]
    #[builder(default)]
    pub quota_renewal_rate: i64,

    /// Grants keyed by API identifier. Empty grants every API.
    #[serde(default)]
    #[builder(default)]
    pub access_rights: BTreeMap<String, AccessDefinition>,

    /// Owning organisation.
    #[serde(default)]
    #[builder(default, into)]
    pub org_id: String,
}

impl SessionState {
    /// Whether quota accounting is disabled for this key.
    #[must_use]
    pub fn has_unlimited_quota(&self) -> bool {
        self.quota_max < 0
    }

    /// Whether the key expired before `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires < now)
    }

    /// Adds or replaces the grant for `definition.api_id`.
    pub fn grant(&mut self, definition: AccessDefinition) {
        self.access_rights.insert(definition.api_id.clone(), definition);
    }

    /// Encodes the session for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if a timestamp is outside the representable range.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes a stored session.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is not a valid session record.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// `Option<DateTime<Utc>>` as Unix seconds with `0` (or any value below 1)
/// meaning "never".
mod unix_or_never {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.map_or(0, |at| at.timestamp()))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        if secs < 1 {
            return Ok(None);
        }
        DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expiry {secs} is out of range")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeDelta;
    use proptest::prelude::*;

    use super::*;

    fn session() -> SessionState {
        let mut session = SessionState::builder()
            .rate(100.0)
            .per(1.0)
            .allowance(100.0)
            .quota_max(10)
            .quota_remaining(10)
            .quota_renewal_rate(300)
            .build();
        session.grant(AccessDefinition::new("31", "Auth Key Test", ["default"]));
        session
    }

    #[test]
    fn test_json_round_trip_preserves_every_field() {
        let mut original = session();
        original.expires = DateTime::from_timestamp(4_102_444_800, 0);
        original.allowance = 0.1 + 0.2;
        original.org_id = "default".into();

        let decoded = SessionState::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded.allowance.to_bits(), original.allowance.to_bits());
        assert_eq!(decoded.last_check, original.last_check);
        assert_eq!(decoded.quota_renews.timestamp(), original.quota_renews.timestamp());
        assert_eq!(decoded.expires, original.expires);
        assert_eq!(decoded.access_rights, original.access_rights);
        assert_eq!(decoded.org_id, "default");
    }

    #[test]
    fn test_zero_expiry_means_never() {
        let json = session().to_json().unwrap();
        assert!(json.contains(r#""expires":0"#), "{json}");

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["expires"] = serde_json::json!(-1);
        let decoded: SessionState = serde_json::from_value(value).unwrap();
        assert!(decoded.expires.is_none());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{"last_check":0,"allowance":5.0,"rate":5.0,"per":1.0,"quota_max":-1,"quota_renews":0}"#;
        let decoded = SessionState::from_json(json).unwrap();
        assert!(decoded.expires.is_none());
        assert!(decoded.access_rights.is_empty());
        assert!(decoded.has_unlimited_quota());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut session = session();
        assert!(!session.is_expired(now));

        session.expires = Some(now - TimeDelta::seconds(1));
        assert!(session.is_expired(now));

        session.expires = Some(now + TimeDelta::seconds(60));
        assert!(!session.is_expired(now));
    }

    #[test]
    fn test_access_definition_versions() {
        let grant = AccessDefinition::new("31", "Auth Key Test", ["default", "v2"]);
        assert!(grant.allows_version("v2"));
        assert!(!grant.allows_version("v3"));
    }

    proptest! {
        #[test]
        fn prop_float_fields_round_trip_exactly(
            rate in 0.0f64..1e9,
            per in 0.001f64..86_400.0,
            allowance in 0.0f64..1e9,
        ) {
            let mut original = session();
            original.rate = rate;
            original.per = per;
            original.allowance = allowance;

            let decoded = SessionState::from_json(&original.to_json().unwrap()).unwrap();
            prop_assert_eq!(decoded.rate.to_bits(), rate.to_bits());
            prop_assert_eq!(decoded.per.to_bits(), per.to_bits());
            prop_assert_eq!(decoded.allowance.to_bits(), allowance.to_bits());
        }
    }
}
