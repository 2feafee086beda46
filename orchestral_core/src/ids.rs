//! Identifier newtypes with pattern validation.
//!
//! Every identifier crossing the run-directory boundary is validated against
//! a fixed pattern before it is used to compute a path. Invalid identifiers
//! are rejected as validation errors, never silently normalized.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{OrchestralError, Result};

static RUN_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^run-\d{14}$").unwrap_or_else(|e| panic!("run id regex: {e}")));

static CRP_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^crp-[A-Za-z0-9_-]{1,60}$").unwrap_or_else(|e| panic!("crp id regex: {e}"))
});

static VCR_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^vcr-[A-Za-z0-9_-]{1,60}$").unwrap_or_else(|e| panic!("vcr id regex: {e}"))
});

/// Immutable run identity of the form `run-YYYYMMDDHHMMSS`.
///
/// Deserialization goes through [`RunId::new`], so a persisted document can
/// never smuggle in a malformed identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Validates and wraps a run identifier.
    ///
    /// # Errors
    ///
    /// Returns a validation error unless the input matches `run-\d{14}`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if RUN_ID_RE.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(OrchestralError::Validation(format!(
                "invalid run id: {id:?}"
            )))
        }
    }

    /// Formats the current UTC timestamp as a fresh run identifier.
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self(format!("run-{}", now.format("%Y%m%d%H%M%S")))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = OrchestralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = OrchestralError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Clarification request identifier: `crp-[A-Za-z0-9_-]{1,60}`, total length <= 64.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CrpId(String);

impl CrpId {
    /// Validates and wraps a CRP identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.len() <= 64 && CRP_ID_RE.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(OrchestralError::Validation(format!(
                "invalid crp id: {id:?}"
            )))
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CrpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CrpId {
    type Err = OrchestralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for CrpId {
    type Error = OrchestralError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<CrpId> for String {
    fn from(id: CrpId) -> Self {
        id.0
    }
}

/// Human-response identifier: `vcr-[A-Za-z0-9_-]{1,60}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VcrId(String);

impl VcrId {
    /// Validates and wraps a VCR identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.len() <= 64 && VCR_ID_RE.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(OrchestralError::Validation(format!(
                "invalid vcr id: {id:?}"
            )))
        }
    }

    /// Generates a fresh identifier from a random UUID.
    pub fn generate() -> Self {
        Self(format!("vcr-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VcrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VcrId {
    type Err = OrchestralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for VcrId {
    type Error = OrchestralError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<VcrId> for String {
    fn from(id: VcrId) -> Self {
        id.0
    }
}

/// Sanitizes an externally supplied session or workspace identifier.
///
/// Keeps `[A-Za-z0-9_-]` characters, truncates to 64, and rejects inputs
/// that end up empty.
pub fn sanitize_identifier(raw: &str) -> Result<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        Err(OrchestralError::Validation(format!(
            "identifier {raw:?} has no usable characters"
        )))
    } else {
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_valid() {
        let id = RunId::new("run-20260101120000").unwrap();
        assert_eq!(id.as_str(), "run-20260101120000");
    }

    #[test]
    fn test_run_id_rejects_malformed() {
        assert!(RunId::new("run-2026").is_err());
        assert!(RunId::new("run-2026010112000a").is_err());
        assert!(RunId::new("other-20260101120000").is_err());
        assert!(RunId::new("run-202601011200000").is_err());
        assert!(RunId::new("").is_err());
    }

    #[test]
    fn test_run_id_generate_round_trips() {
        let now = Utc::now();
        let id = RunId::generate(now);
        assert!(RunId::new(id.as_str()).is_ok());
    }

    #[test]
    fn test_crp_id_bounds() {
        assert!(CrpId::new("crp-001").is_ok());
        assert!(CrpId::new("crp-").is_err());
        assert!(CrpId::new(format!("crp-{}", "a".repeat(60))).is_ok());
        assert!(CrpId::new(format!("crp-{}", "a".repeat(61))).is_err());
        assert!(CrpId::new("crp-has space").is_err());
    }

    #[test]
    fn test_vcr_id_generate_is_valid() {
        let id = VcrId::generate();
        assert!(VcrId::new(id.as_str()).is_ok());
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("work space!").unwrap(), "workspace");
        assert_eq!(
            sanitize_identifier(&"x".repeat(100)).unwrap().len(),
            64
        );
        assert!(sanitize_identifier("!!!").is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let id = RunId::new("run-20260101120000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"run-20260101120000\"");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
