//! Route definitions, create/update payloads and input validation

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Cloud metadata endpoint, never a valid proxy target
const CLOUD_METADATA_IP: &str = "169.254.169.254";

/// Longest accepted hostname
const MAX_HOST_LEN: usize = 253;

/// Scheme used to reach a route's target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[serde(alias = "HTTP")]
    Http,
    #[serde(alias = "HTTPS")]
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Restrictions applied to route targets
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetPolicy {
    /// Require IP-literal targets to be private, non-loopback addresses
    #[serde(default)]
    pub private_targets_only: bool,
}

/// A configured path-to-backend mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub path: String,
    pub name: String,
    pub protocol: Protocol,
    pub target_ip: String,
    pub target_port: u16,
    pub target_path: String,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub health_check_enabled: bool,
    /// Overrides the global check interval for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    pub(crate) fn from_fields(id: String, fields: RouteFields, now: DateTime<Utc>) -> Self {
        Self {
            id,
            path: fields.path,
            name: fields.name,
            protocol: fields.protocol,
            target_ip: fields.target_ip,
            target_port: fields.target_port,
            target_path: fields.target_path,
            timeout_seconds: fields.timeout_seconds,
            enabled: fields.enabled,
            health_check_enabled: fields.health_check_enabled,
            check_interval_secs: fields.check_interval_secs,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace every user-editable field, keeping id and creation time
    pub(crate) fn apply_fields(&mut self, fields: RouteFields, now: DateTime<Utc>) {
        self.path = fields.path;
        self.name = fields.name;
        self.protocol = fields.protocol;
        self.target_ip = fields.target_ip;
        self.target_port = fields.target_port;
        self.target_path = fields.target_path;
        self.timeout_seconds = fields.timeout_seconds;
        self.enabled = fields.enabled;
        self.health_check_enabled = fields.health_check_enabled;
        self.check_interval_secs = fields.check_interval_secs;
        self.updated_at = now;
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn check_interval(&self, default: Duration) -> Duration {
        self.check_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Host and port as they appear in a URL (IPv6 literals bracketed)
    pub fn authority(&self) -> String {
        if self.target_ip.contains(':') {
            format!("[{}]:{}", self.target_ip, self.target_port)
        } else {
            format!("{}:{}", self.target_ip, self.target_port)
        }
    }

    pub fn target_url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.authority(), self.target_path)
    }

    /// Whether both routes point at the same backend endpoint
    pub fn same_target(&self, other: &Route) -> bool {
        self.protocol == other.protocol
            && self.target_ip == other.target_ip
            && self.target_port == other.target_port
            && self.target_path == other.target_path
    }

    /// The payload that would recreate this route
    pub fn to_spec(&self) -> RouteSpec {
        RouteSpec {
            path: self.path.clone(),
            name: self.name.clone(),
            protocol: self.protocol,
            target_ip: self.target_ip.clone(),
            target_port: i64::from(self.target_port),
            target_path: self.target_path.clone(),
            timeout_seconds: self.timeout_seconds as i64,
            enabled: self.enabled,
            health_check_enabled: self.health_check_enabled,
            check_interval_secs: self.check_interval_secs,
        }
    }
}

/// Create/update payload for a route.
///
/// Numeric fields are signed so that out-of-range input reaches validation
/// instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub target_ip: String,
    pub target_port: i64,
    #[serde(default = "default_target_path")]
    pub target_path: String,
    #[serde(default = "default_timeout_seconds", alias = "timeout")]
    pub timeout_seconds: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true", alias = "health_check")]
    pub health_check_enabled: bool,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
}

impl RouteSpec {
    /// Create an enabled, health-checked http route spec with defaults
    pub fn new(path: &str, name: &str, target_ip: &str, target_port: u16) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            protocol: Protocol::Http,
            target_ip: target_ip.to_string(),
            target_port: i64::from(target_port),
            target_path: default_target_path(),
            timeout_seconds: default_timeout_seconds(),
            enabled: true,
            health_check_enabled: true,
            check_interval_secs: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_target_path(mut self, target_path: &str) -> Self {
        self.target_path = target_path.to_string();
        self
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_health_check(mut self, enabled: bool) -> Self {
        self.health_check_enabled = enabled;
        self
    }

    pub fn with_check_interval(mut self, seconds: u64) -> Self {
        self.check_interval_secs = Some(seconds);
        self
    }

    /// Validate and normalize the payload
    pub fn validate(&self, policy: &TargetPolicy) -> Result<RouteFields, RegistryError> {
        if self.check_interval_secs == Some(0) {
            return Err(RegistryError::validation(
                "check_interval_secs",
                "Check interval must be a positive integer",
            ));
        }

        Ok(RouteFields {
            path: validate_path(&self.path)?,
            name: validate_name(&self.name)?,
            protocol: self.protocol,
            target_ip: validate_target_host(&self.target_ip, policy)?,
            target_port: validate_port(self.target_port)?,
            target_path: normalize_target_path(&self.target_path),
            timeout_seconds: validate_timeout(self.timeout_seconds)?,
            enabled: self.enabled,
            health_check_enabled: self.health_check_enabled,
            check_interval_secs: self.check_interval_secs,
        })
    }
}

/// Validated, normalized route fields
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFields {
    pub path: String,
    pub name: String,
    pub protocol: Protocol,
    pub target_ip: String,
    pub target_port: u16,
    pub target_path: String,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub health_check_enabled: bool,
    pub check_interval_secs: Option<u64>,
}

/// Partial update payload; absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteUpdate {
    pub path: Option<String>,
    pub name: Option<String>,
    pub protocol: Option<Protocol>,
    pub target_ip: Option<String>,
    pub target_port: Option<i64>,
    pub target_path: Option<String>,
    #[serde(alias = "timeout")]
    pub timeout_seconds: Option<i64>,
    pub enabled: Option<bool>,
    #[serde(alias = "health_check")]
    pub health_check_enabled: Option<bool>,
    pub check_interval_secs: Option<u64>,
}

impl RouteUpdate {
    /// Merge onto an existing route, producing a full spec
    pub fn apply_to(self, current: &Route) -> RouteSpec {
        let base = current.to_spec();
        RouteSpec {
            path: self.path.unwrap_or(base.path),
            name: self.name.unwrap_or(base.name),
            protocol: self.protocol.unwrap_or(base.protocol),
            target_ip: self.target_ip.unwrap_or(base.target_ip),
            target_port: self.target_port.unwrap_or(base.target_port),
            target_path: self.target_path.unwrap_or(base.target_path),
            timeout_seconds: self.timeout_seconds.unwrap_or(base.timeout_seconds),
            enabled: self.enabled.unwrap_or(base.enabled),
            health_check_enabled: self
                .health_check_enabled
                .unwrap_or(base.health_check_enabled),
            check_interval_secs: self.check_interval_secs.or(base.check_interval_secs),
        }
    }
}

fn default_target_path() -> String {
    "/".to_string()
}

fn default_timeout_seconds() -> i64 {
    30
}

fn default_true() -> bool {
    true
}

/// Normalize a route path: leading slash, no trailing slash, restricted charset
pub fn validate_path(path: &str) -> Result<String, RegistryError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(RegistryError::validation("path", "Path cannot be empty"));
    }

    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    let body = &normalized[1..];
    let valid = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'));
    if !valid {
        return Err(RegistryError::validation(
            "path",
            "Path must contain only alphanumeric characters, dash, underscore, and forward slash",
        ));
    }

    Ok(normalized)
}

pub fn validate_name(name: &str) -> Result<String, RegistryError> {
    let cleaned = name.trim();
    if cleaned.is_empty() {
        return Err(RegistryError::validation("name", "Name cannot be empty"));
    }
    Ok(cleaned.to_string())
}

pub fn validate_port(port: i64) -> Result<u16, RegistryError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| RegistryError::validation("target_port", "Port must be between 1 and 65535"))
}

/// Longest probe timeout a route may ask for
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

pub fn validate_timeout(timeout: i64) -> Result<u64, RegistryError> {
    u64::try_from(timeout)
        .ok()
        .filter(|t| (1..=MAX_TIMEOUT_SECONDS).contains(t))
        .ok_or_else(|| {
            RegistryError::validation(
                "timeout_seconds",
                format!("Timeout must be between 1 and {} seconds", MAX_TIMEOUT_SECONDS),
            )
        })
}

/// Ensure a target path starts with `/`; an empty path means `/`.
///
/// Characters are not checked here, a path the prober cannot use is reported
/// as a misconfiguration at probe time.
pub fn normalize_target_path(target_path: &str) -> String {
    let trimmed = target_path.trim();
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Validate a target host: an IP literal or a DNS hostname
pub fn validate_target_host(host: &str, policy: &TargetPolicy) -> Result<String, RegistryError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(RegistryError::validation("target_ip", "Target IP cannot be empty"));
    }

    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        check_ip_policy(&ip, policy)?;
        return Ok(ip.to_string());
    }

    let valid_hostname = host.len() <= MAX_HOST_LEN
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid_hostname {
        return Err(RegistryError::validation(
            "target_ip",
            format!("Invalid target host: '{}'", host),
        ));
    }

    Ok(host.to_ascii_lowercase())
}

fn check_ip_policy(ip: &IpAddr, policy: &TargetPolicy) -> Result<(), RegistryError> {
    if ip.to_string() == CLOUD_METADATA_IP {
        return Err(RegistryError::validation(
            "target_ip",
            "Cloud metadata IP is not allowed",
        ));
    }

    if !policy.private_targets_only {
        return Ok(());
    }

    if ip.is_loopback() {
        return Err(RegistryError::validation(
            "target_ip",
            "Localhost IPs are not allowed",
        ));
    }

    let private = match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7 unique local addresses
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    };
    if !private {
        return Err(RegistryError::validation(
            "target_ip",
            "Only private IP addresses are allowed (10.x.x.x, 192.168.x.x, 172.16-31.x.x)",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_normalizes() {
        assert_eq!(validate_path("jellyfin").unwrap(), "/jellyfin");
        assert_eq!(validate_path("/media/").unwrap(), "/media");
        assert_eq!(validate_path("/a/b_c-d").unwrap(), "/a/b_c-d");
    }

    #[test]
    fn test_validate_path_rejects_bad_input() {
        assert!(validate_path("").is_err());
        assert!(validate_path("/").is_err());
        assert!(validate_path("/with space").is_err());
        assert!(validate_path("/query?x=1").is_err());
        assert!(validate_path("/dots.are.bad").is_err());
    }

    #[test]
    fn test_validate_port_range() {
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(-80).is_err());
    }

    #[test]
    fn test_validate_timeout() {
        assert_eq!(validate_timeout(30).unwrap(), 30);
        assert_eq!(validate_timeout(3600).unwrap(), MAX_TIMEOUT_SECONDS);
        assert!(validate_timeout(0).is_err());
        assert!(validate_timeout(-1).is_err());
        assert!(validate_timeout(3601).is_err());
        assert!(validate_timeout(i64::MAX).is_err());
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("  Media  ").unwrap(), "Media");
        assert!(validate_name("   ").is_err());
    }

    #[test]
    fn test_target_path_normalization() {
        assert_eq!(normalize_target_path(""), "/");
        assert_eq!(normalize_target_path("health"), "/health");
        assert_eq!(normalize_target_path("/status"), "/status");
    }

    #[test]
    fn test_target_host_accepts_ips_and_hostnames() {
        let policy = TargetPolicy::default();
        assert_eq!(
            validate_target_host("192.168.1.10", &policy).unwrap(),
            "192.168.1.10"
        );
        assert_eq!(
            validate_target_host("nonexistent.invalid", &policy).unwrap(),
            "nonexistent.invalid"
        );
        assert_eq!(validate_target_host("[::1]", &policy).unwrap(), "::1");
        assert_eq!(
            validate_target_host("Media-Server.LAN", &policy).unwrap(),
            "media-server.lan"
        );
    }

    #[test]
    fn test_target_host_rejects_garbage() {
        let policy = TargetPolicy::default();
        assert!(validate_target_host("", &policy).is_err());
        assert!(validate_target_host("bad host", &policy).is_err());
        assert!(validate_target_host("a..b", &policy).is_err());
        assert!(validate_target_host("-lead.example", &policy).is_err());
    }

    #[test]
    fn test_metadata_ip_always_blocked() {
        let policy = TargetPolicy::default();
        let err = validate_target_host("169.254.169.254", &policy).unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn test_private_targets_only_policy() {
        let policy = TargetPolicy {
            private_targets_only: true,
        };
        assert!(validate_target_host("10.0.0.5", &policy).is_ok());
        assert!(validate_target_host("172.16.4.1", &policy).is_ok());
        assert!(validate_target_host("127.0.0.1", &policy).is_err());
        assert!(validate_target_host("8.8.8.8", &policy).is_err());
        assert!(validate_target_host("fd00::1", &policy).is_ok());
    }

    #[test]
    fn test_spec_deserializes_console_payload() {
        let json = r#"{
            "path": "jellyfin",
            "name": "Jellyfin",
            "target_ip": "192.168.1.20",
            "target_port": 8096,
            "protocol": "HTTP",
            "timeout": 10,
            "health_check": false
        }"#;
        let spec: RouteSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.protocol, Protocol::Http);
        assert_eq!(spec.timeout_seconds, 10);
        assert!(!spec.health_check_enabled);
        assert!(spec.enabled);
        assert_eq!(spec.target_path, "/");

        let fields = spec.validate(&TargetPolicy::default()).unwrap();
        assert_eq!(fields.path, "/jellyfin");
        assert_eq!(fields.target_port, 8096);
    }

    #[test]
    fn test_spec_rejects_zero_check_interval() {
        let spec = RouteSpec::new("/a", "A", "10.0.0.1", 80).with_check_interval(0);
        let err = spec.validate(&TargetPolicy::default()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_route_urls() {
        let fields = RouteSpec::new("/a", "A", "10.0.0.1", 8443)
            .with_protocol(Protocol::Https)
            .with_target_path("health")
            .validate(&TargetPolicy::default())
            .unwrap();
        let route = Route::from_fields("id".into(), fields, Utc::now());
        assert_eq!(route.target_url(), "https://10.0.0.1:8443/health");

        let fields = RouteSpec::new("/b", "B", "fd00::1", 80)
            .validate(&TargetPolicy::default())
            .unwrap();
        let route = Route::from_fields("id".into(), fields, Utc::now());
        assert_eq!(route.authority(), "[fd00::1]:80");
    }

    #[test]
    fn test_update_merges_onto_route() {
        let fields = RouteSpec::new("/a", "A", "10.0.0.1", 80)
            .validate(&TargetPolicy::default())
            .unwrap();
        let route = Route::from_fields("id".into(), fields, Utc::now());

        let update: RouteUpdate = serde_json::from_str(r#"{"name": "Renamed", "timeout": 5}"#).unwrap();
        let spec = update.apply_to(&route);
        assert_eq!(spec.name, "Renamed");
        assert_eq!(spec.timeout_seconds, 5);
        assert_eq!(spec.path, "/a");
        assert_eq!(spec.target_port, 80);
    }
}
