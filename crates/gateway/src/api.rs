//! Parsed API definitions.
//!
//! An [`ApiSpec`] is the already-parsed description of one API the gateway
//! fronts. The field layout follows the JSON API definitions the gateway is
//! configured with, so fixtures can be written in that layout; loading the
//! documents themselves is the embedding process's job.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use http::Method;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::request::AdmissionRequest;

/// Name of the implicit version of an unversioned API.
pub const DEFAULT_VERSION_NAME: &str = "Default";

/// Layout of version expiry timestamps.
pub const VERSION_EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M";

/// One API as seen by the admission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSpec {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Identifier matched against session access rights.
    pub api_id: String,
    /// Owning organisation.
    #[serde(default)]
    pub org_id: String,
    /// Where the requested version is read from.
    #[serde(default)]
    pub definition: VersionDefinition,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Versions and their path rules.
    #[serde(default)]
    pub version_data: VersionData,
    /// Listen and upstream settings.
    pub proxy: ProxyConfig,
    /// Whether [`allowed_ips`](Self::allowed_ips) is enforced.
    #[serde(default)]
    pub enable_ip_whitelisting: bool,
    /// Addresses or CIDR ranges allowed to call the API.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// Where a request names its version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionLocation {
    /// A request header.
    #[default]
    Header,
    /// A query string parameter.
    UrlParam,
}

/// Version lookup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDefinition {
    /// Header or query parameter.
    #[serde(default)]
    pub location: VersionLocation,
    /// Name of the header or parameter.
    #[serde(default = "default_version_key")]
    pub key: String,
}

impl Default for VersionDefinition {
    fn default() -> Self {
        Self { location: VersionLocation::default(), key: default_version_key() }
    }
}

fn default_version_key() -> String {
    "version".to_owned()
}

/// Authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the key.
    #[serde(default = "default_auth_header")]
    pub auth_header_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { auth_header_name: default_auth_header() }
    }
}

fn default_auth_header() -> String {
    "Authorization".to_owned()
}

/// The API's versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionData {
    /// The API has a single version and requests need not name one.
    #[serde(default)]
    pub not_versioned: bool,
    /// Version used when a request names none.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_version: String,
    /// Versions by name.
    #[serde(default)]
    pub versions: BTreeMap<String, VersionInfo>,
}

/// One version of an API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version name.
    #[serde(default)]
    pub name: String,
    /// When the version stops being served; `None` never.
    #[serde(default, with = "version_expiry")]
    pub expires: Option<DateTime<Utc>>,
    /// Path rules.
    #[serde(default)]
    pub paths: VersionPaths,
}

impl VersionInfo {
    /// Whether the version expired before `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires < now)
    }
}

/// Path rules of a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPaths {
    /// Paths served without authentication.
    #[serde(default)]
    pub ignored: Vec<PathRule>,
    /// When non-empty, the only paths that may be called.
    #[serde(default)]
    pub white_list: Vec<PathRule>,
    /// Paths that may never be called.
    #[serde(default)]
    pub black_list: Vec<PathRule>,
}

/// How a request path relates to a version's rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Served without authentication.
    Ignored,
    /// Explicitly allowed.
    WhiteListed,
    /// Explicitly forbidden.
    BlackListed,
    /// No rule applies.
    NotListed,
    /// A white list exists and the path is not on it.
    NotOnWhiteList,
}

impl PathStatus {
    /// Whether the pipeline must refuse the path.
    #[must_use]
    pub fn is_denied(self) -> bool {
        matches!(self, Self::BlackListed | Self::NotOnWhiteList)
    }
}

impl VersionPaths {
    /// Classifies `path`, relative to the listen path, for `method`.
    ///
    /// Ignored rules win over the black list, which wins over the white list.
    #[must_use]
    pub fn classify(&self, method: &Method, path: &str) -> PathStatus {
        let hit = |rules: &[PathRule]| rules.iter().any(|rule| rule.matches(method, path));
        if hit(&self.ignored) {
            PathStatus::Ignored
        } else if hit(&self.black_list) {
            PathStatus::BlackListed
        } else if hit(&self.white_list) {
            PathStatus::WhiteListed
        } else if self.white_list.is_empty() {
            PathStatus::NotListed
        } else {
            PathStatus::NotOnWhiteList
        }
    }
}

/// A path prefix, optionally limited to some methods.
///
/// Deserializes from a bare string or from `{"path": ..., "methods": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPathRule")]
pub struct PathRule {
    /// Prefix of the path relative to the listen path.
    pub path: String,
    /// Methods the rule applies to; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPathRule {
    Bare(String),
    Full {
        path: String,
        #[serde(default)]
        methods: Vec<String>,
    },
}

impl From<RawPathRule> for PathRule {
    fn from(raw: RawPathRule) -> Self {
        match raw {
            RawPathRule::Bare(path) => Self { path, methods: Vec::new() },
            RawPathRule::Full { path, methods } => Self { path, methods },
        }
    }
}

impl PathRule {
    /// A rule matching `path` for every method.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), methods: Vec::new() }
    }

    /// Whether the rule covers `method` on `path`.
    #[must_use]
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        let prefix = self.path.trim_start_matches('/');
        if prefix.is_empty() {
            return false;
        }
        let method_ok =
            self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()));
        method_ok && path.trim_start_matches('/').starts_with(prefix)
    }
}

/// Listen and upstream settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Path prefix the API is served under.
    pub listen_path: String,
    /// Upstream base URL.
    #[serde(default)]
    pub target_url: String,
    /// Remove the listen path before forwarding.
    #[serde(default)]
    pub strip_listen_path: bool,
}

impl ProxyConfig {
    /// `path` with the listen path removed, or unchanged if it lies outside it.
    #[must_use]
    pub fn relative_path<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.listen_path.as_str())
            .or_else(|| path.strip_prefix(self.listen_path.trim_end_matches('/')))
            .unwrap_or(path)
    }

    /// Path to request upstream.
    #[must_use]
    pub fn upstream_path(&self, path: &str) -> String {
        if !self.strip_listen_path {
            return path.to_owned();
        }
        let relative = self.relative_path(path).trim_start_matches('/');
        format!("/{relative}")
    }
}

/// Why no version could be selected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// The request names no version and the API has no default.
    #[error("API version not specified")]
    Missing,
    /// The requested version does not exist.
    #[error("API version {0} does not exist")]
    Unknown(String),
}

impl ApiSpec {
    /// Parses a definition in its JSON layout.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is not a valid definition.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Selects the version `request` targets.
    ///
    /// Unversioned APIs use `default_version`, then `Default`, then their
    /// first version. Versioned APIs read the version from the header or
    /// query parameter and fall back to `default_version`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] when no version applies.
    pub fn resolve_version(
        &self,
        request: &AdmissionRequest,
    ) -> Result<(&str, &VersionInfo), VersionError> {
        let versions = &self.version_data.versions;
        let named = |name: &str| {
            versions
                .get_key_value(name)
                .map(|(name, info)| (name.as_str(), info))
                .ok_or_else(|| VersionError::Unknown(name.to_owned()))
        };

        if self.version_data.not_versioned {
            if !self.version_data.default_version.is_empty() {
                return named(&self.version_data.default_version);
            }
            return named(DEFAULT_VERSION_NAME).or_else(|_| {
                versions
                    .iter()
                    .next()
                    .map(|(name, info)| (name.as_str(), info))
                    .ok_or(VersionError::Missing)
            });
        }

        let requested = match self.definition.location {
            VersionLocation::Header => request.header(&self.definition.key).map(str::to_owned),
            VersionLocation::UrlParam => request.query_param(&self.definition.key),
        };
        match requested.filter(|name| !name.is_empty()) {
            Some(name) => named(&name),
            None if !self.version_data.default_version.is_empty() => {
                named(&self.version_data.default_version)
            },
            None => Err(VersionError::Missing),
        }
    }
}

/// `Option<DateTime<Utc>>` as `"YYYY-MM-DD HH:MM"` in UTC, empty for never.
mod version_expiry {
    use super::*;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.collect_str(&at.format(VERSION_EXPIRY_FORMAT)),
            None => serializer.serialize_str(""),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(raw, VERSION_EXPIRY_FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(|err| serde::de::Error::custom(format!("invalid version expiry {raw:?}: {err}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    const VERSIONED: &str = r#"{
        "name": "Versioned",
        "api_id": "7",
        "definition": {"location": "url-param", "key": "v"},
        "version_data": {
            "not_versioned": false,
            "default_version": "v1",
            "versions": {
                "v1": {"name": "v1", "expires": ""},
                "v2": {
                    "name": "v2",
                    "expires": "2000-01-01 00:00",
                    "paths": {
                        "ignored": ["/health"],
                        "white_list": [],
                        "black_list": [{"path": "/admin", "methods": ["DELETE"]}]
                    }
                }
            }
        },
        "proxy": {"listen_path": "/svc/", "target_url": "http://upstream/", "strip_listen_path": true}
    }"#;

    #[test]
    fn test_parse_defaults() {
        let spec = ApiSpec::from_json(VERSIONED).unwrap();
        assert_eq!(spec.auth.auth_header_name, "Authorization");
        assert_eq!(spec.definition.location, VersionLocation::UrlParam);
        assert!(!spec.enable_ip_whitelisting);

        let v2 = &spec.version_data.versions["v2"];
        assert_eq!(v2.expires, Some(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()));
        assert!(v2.is_expired(Utc::now()));
        assert_eq!(v2.paths.ignored, [PathRule::new("/health")]);
        assert_eq!(v2.paths.black_list[0].methods, ["DELETE"]);
        assert_eq!(spec.version_data.versions["v1"].expires, None);
    }

    #[test]
    fn test_invalid_expiry_is_rejected() {
        let raw = VERSIONED.replace("2000-01-01 00:00", "soon");
        assert!(ApiSpec::from_json(&raw).is_err());
    }

    #[rstest]
    #[case("/svc/?v=v2", Ok("v2"))]
    #[case("/svc/", Ok("v1"))]
    #[case("/svc/?v=v9", Err(VersionError::Unknown("v9".into())))]
    fn test_resolve_versioned(#[case] uri: &str, #[case] expected: Result<&str, VersionError>) {
        let spec = ApiSpec::from_json(VERSIONED).unwrap();
        let request = AdmissionRequest::new(Method::GET, uri);
        let resolved = spec.resolve_version(&request).map(|(name, _)| name);
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_resolve_missing_without_default() {
        let mut spec = ApiSpec::from_json(VERSIONED).unwrap();
        spec.version_data.default_version.clear();
        let request = AdmissionRequest::new(Method::GET, "/svc/");
        assert_eq!(spec.resolve_version(&request).unwrap_err(), VersionError::Missing);
    }

    #[test]
    fn test_resolve_from_header() {
        let mut spec = ApiSpec::from_json(VERSIONED).unwrap();
        spec.definition = VersionDefinition { location: VersionLocation::Header, key: "x-api-version".into() };
        let request = AdmissionRequest::new(Method::GET, "/svc/?v=v1").with_header("X-API-Version", "v2");
        assert_eq!(spec.resolve_version(&request).unwrap().0, "v2");
    }

    #[test]
    fn test_resolve_unversioned_falls_back_to_first() {
        let mut spec = ApiSpec::from_json(VERSIONED).unwrap();
        spec.version_data.not_versioned = true;
        spec.version_data.default_version.clear();
        let request = AdmissionRequest::new(Method::GET, "/svc/?v=v2");
        assert_eq!(spec.resolve_version(&request).unwrap().0, "v1");
    }

    #[rstest]
    #[case(Method::GET, "health/live", PathStatus::Ignored)]
    #[case(Method::DELETE, "admin/users", PathStatus::BlackListed)]
    #[case(Method::GET, "admin/users", PathStatus::NotListed)]
    #[case(Method::GET, "orders", PathStatus::NotListed)]
    fn test_classify_paths(#[case] method: Method, #[case] path: &str, #[case] status: PathStatus) {
        let spec = ApiSpec::from_json(VERSIONED).unwrap();
        let paths = &spec.version_data.versions["v2"].paths;
        assert_eq!(paths.classify(&method, path), status);
    }

    #[test]
    fn test_white_list_denies_unlisted_paths() {
        let paths = VersionPaths {
            white_list: vec![PathRule::new("orders")],
            ..VersionPaths::default()
        };
        assert_eq!(paths.classify(&Method::GET, "/orders/1"), PathStatus::WhiteListed);
        assert_eq!(paths.classify(&Method::GET, "/users"), PathStatus::NotOnWhiteList);
        assert!(PathStatus::NotOnWhiteList.is_denied());
        assert!(!PathStatus::WhiteListed.is_denied());
    }

    #[test]
    fn test_empty_rule_matches_nothing() {
        assert!(!PathRule::new("/").matches(&Method::GET, "/anything"));
    }

    #[test]
    fn test_listen_path_handling() {
        let proxy = ProxyConfig {
            listen_path: "/svc/".into(),
            target_url: String::new(),
            strip_listen_path: true,
        };
        assert_eq!(proxy.relative_path("/svc/orders"), "orders");
        assert_eq!(proxy.relative_path("/svc"), "");
        assert_eq!(proxy.relative_path("/other"), "/other");
        assert_eq!(proxy.upstream_path("/svc/orders"), "/orders");

        let kept = ProxyConfig { strip_listen_path: false, ..proxy };
        assert_eq!(kept.upstream_path("/svc/orders"), "/svc/orders");
    }
}
