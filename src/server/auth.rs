// Access-token claims and the permission predicate.
//
// Token verification happens upstream (the API gateway validates signatures
// and expiry); what reaches this server is the claims document itself,
// carried in the `X-Flow-Claims` header. Claims map each query kind to its
// allowed actions and spatial aggregation levels.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::Deserialize;

use crate::error::{FlowError, Result};

pub const CLAIMS_HEADER: &str = "x-flow-claims";

/// Kind tag used for the geography endpoint's permission axis.
pub const GEOGRAPHY_KIND: &str = "geography";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Poll,
    GetResult,
}

impl Action {
    fn claim_name(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Poll => "poll",
            Action::GetResult => "get_result",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KindClaims {
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    #[serde(default)]
    pub spatial_aggregation: Vec<String>,
}

/// Verified claims: query kind to permitted actions and levels.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct TokenClaims(pub HashMap<String, KindClaims>);

impl TokenClaims {
    /// Parse the pre-verified claims header. No header means no rights.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let Some(raw) = headers.get(CLAIMS_HEADER) else {
            return Err(FlowError::PermissionDenied(
                "no access token claims supplied".to_string(),
            ));
        };
        let raw = raw
            .to_str()
            .map_err(|_| FlowError::PermissionDenied("malformed claims header".to_string()))?;
        serde_json::from_str(raw)
            .map_err(|_| FlowError::PermissionDenied("malformed claims header".to_string()))
    }

    /// Is `action` on `kind` allowed, optionally at a spatial level?
    pub fn is_permitted(&self, kind: &str, action: Action, level: Option<&str>) -> bool {
        let Some(claims) = self.0.get(kind) else {
            return false;
        };
        if !claims.permissions.get(action.claim_name()).copied().unwrap_or(false) {
            return false;
        }
        match level {
            Some(level) => claims.spatial_aggregation.iter().any(|l| l == level),
            None => true,
        }
    }

    /// Error-returning form for handlers.
    pub fn check(&self, kind: &str, action: Action, level: Option<&str>) -> Result<()> {
        if self.is_permitted(kind, action, level) {
            Ok(())
        } else {
            Err(FlowError::PermissionDenied(format!(
                "token does not permit {} on {kind}",
                action.claim_name()
            )))
        }
    }
}
