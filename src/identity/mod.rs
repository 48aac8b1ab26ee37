// # Query Identity
//
// Content-addressed identification of logical queries. Two queries with the
// same kind and equivalent canonical parameters hash to the same identifier,
// which is what makes de-duplication and cache lookups work across workers.

use std::fmt;

use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length in hex characters of a query identifier.
pub const QUERY_ID_LEN: usize = 32;

/// Opaque content-addressed identifier of a logical query.
///
/// A fixed-length lowercase hex string derived from the query kind and its
/// canonical parameters. Stable across processes as long as the
/// canonicalization rules are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    /// Wrap an identifier received from a client or read back from storage.
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coordination-store key holding this query's state string.
    pub fn state_key(&self) -> String {
        format!("{}-state", self.0)
    }

    /// Coordination-store key holding this query's last execution error.
    pub fn error_key(&self) -> String {
        format!("{}-error", self.0)
    }

    /// Coordination-store key recording which kind this qid was submitted
    /// as, so poll and retrieval can check per-kind permissions.
    pub fn kind_key(&self) -> String {
        format!("{}-kind", self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the identifier for `kind` with already-canonical parameters.
///
/// The canonical byte encoding is the kind tag, a NUL separator, and the
/// compact JSON rendering of the parameters. `serde_json`'s object map is
/// ordered, so key order in the input cannot leak into the digest. The
/// digest is SHA-256 truncated to 32 lowercase hex characters; collisions
/// are assumed cryptographically negligible and are not handled.
pub fn fingerprint(kind: &str, canonical_params: &Value) -> QueryId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    // Serializing a Value cannot fail outside of non-string keys, which the
    // canonical parameter shape excludes.
    hasher.update(canonical_params.to_string().as_bytes());
    let digest = hasher.finalize();
    QueryId(hex::encode(digest)[..QUERY_ID_LEN].to_string())
}

/// Parse the date formats accepted at the API boundary.
pub fn parse_datestring(raw: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(datetime) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(datetime.date());
    }
    NaiveDate::parse_from_str(raw, "%Y/%m/%d").ok()
}
