// # Query Kinds
//
// The closed registry of exposed query kinds: each kind contributes a
// validator (raw parameters to canonical parameters, or a per-field message
// tree) and a builder (canonical parameters to a descriptor). The request
// layer and the blob decoder dispatch exclusively through this table.

pub mod daily_location;
pub mod descriptor;
pub mod flows;
pub mod location_event_counts;
pub mod meaningful_locations;
pub mod modal_location;
pub mod raw_table;
pub mod rules;
pub mod subscriber_locations;

pub use descriptor::QueryDescriptor;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{FlowError, Result, ValidationMessages};
use crate::identity::{fingerprint, QueryId};

/// External tag of the base raw-table kind.
pub const RAW_TABLE_KIND: &str = "table";

/// Spatial aggregation levels accepted by the location kinds, and the
/// permission axis of access tokens.
pub const AGGREGATION_UNITS: &[&str] = &["admin0", "admin1", "admin2", "admin3"];

/// Accepted subscriber subsets. Only the full population is exposed.
pub const SUBSCRIBER_SUBSETS: &[&str] = &["all"];

/// Location-code column for an aggregation unit.
pub fn unit_column(unit: &str) -> String {
    format!("{unit}pcod")
}

/// One registered query kind.
pub struct KindSpec {
    pub tag: &'static str,
    pub validate: fn(&Value) -> std::result::Result<Value, ValidationMessages>,
    pub build: fn(Value) -> Result<QueryDescriptor>,
}

static REGISTRY: Lazy<HashMap<&'static str, KindSpec>> = Lazy::new(|| {
    let specs = [
        KindSpec {
            tag: "daily_location",
            validate: daily_location::validate,
            build: daily_location::build,
        },
        KindSpec {
            tag: "modal_location",
            validate: modal_location::validate,
            build: modal_location::build,
        },
        KindSpec {
            tag: "flows",
            validate: flows::validate,
            build: flows::build,
        },
        KindSpec {
            tag: "location_event_counts",
            validate: location_event_counts::validate,
            build: location_event_counts::build,
        },
        KindSpec {
            tag: "subscriber_locations",
            validate: subscriber_locations::validate,
            build: subscriber_locations::build,
        },
        KindSpec {
            tag: "meaningful_locations_aggregate",
            validate: meaningful_locations::aggregate::validate,
            build: meaningful_locations::aggregate::build,
        },
        KindSpec {
            tag: "meaningful_locations_between_label_od_matrix",
            validate: meaningful_locations::between_label_od_matrix::validate,
            build: meaningful_locations::between_label_od_matrix::build,
        },
        KindSpec {
            tag: "meaningful_locations_between_dates_od_matrix",
            validate: meaningful_locations::between_dates_od_matrix::validate,
            build: meaningful_locations::between_dates_od_matrix::build,
        },
        KindSpec {
            tag: RAW_TABLE_KIND,
            validate: raw_table::validate,
            build: raw_table::build,
        },
    ];
    specs.into_iter().map(|spec| (spec.tag, spec)).collect()
});

pub fn kind_spec(tag: &str) -> Result<&'static KindSpec> {
    REGISTRY
        .get(tag)
        .ok_or_else(|| FlowError::InvalidQueryKind(tag.to_string()))
}

/// Registered kind tags, for diagnostics.
pub fn kinds() -> Vec<&'static str> {
    let mut tags: Vec<&'static str> = REGISTRY.keys().copied().collect();
    tags.sort_unstable();
    tags
}

/// Validate raw parameters into their canonical form.
pub fn canonicalize(kind: &str, params: &Value) -> Result<Value> {
    let spec = kind_spec(kind)?;
    (spec.validate)(params).map_err(FlowError::QueryParamsValidation)
}

/// Fingerprint of a submission's canonical parameters. For kinds exposed as
/// their spatial aggregate, the qid `/run` hands back is the aggregate's,
/// derived from this one.
pub fn query_id(kind: &str, params: &Value) -> Result<QueryId> {
    Ok(fingerprint(kind, &canonicalize(kind, params)?))
}

/// Validate and build in one step: the entry point for `/run`.
pub fn make_descriptor(kind: &str, params: &Value) -> Result<QueryDescriptor> {
    let canonical = canonicalize(kind, params)?;
    build_canonical(kind, canonical)
}

/// Build from parameters that are already canonical (nested builders, blob
/// reconstruction).
pub(crate) fn build_canonical(kind: &str, params: Value) -> Result<QueryDescriptor> {
    (kind_spec(kind)?.build)(params)
}

/// Read a canonical string parameter. Failure means a builder was handed
/// uncanonical parameters, which is an internal invariant violation.
pub(crate) fn param_str(params: &Value, field: &str) -> Result<String> {
    params[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| FlowError::Configuration(format!("missing canonical field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_is_the_closed_set() {
        assert_eq!(
            kinds(),
            vec![
                "daily_location",
                "flows",
                "location_event_counts",
                "meaningful_locations_aggregate",
                "meaningful_locations_between_dates_od_matrix",
                "meaningful_locations_between_label_od_matrix",
                "modal_location",
                "subscriber_locations",
                "table",
            ]
        );
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            make_descriptor("radius_of_gyration", &json!({})),
            Err(FlowError::InvalidQueryKind(_))
        ));
    }

    #[test]
    fn test_fingerprint_equal_across_default_fill() {
        let explicit = json!({
            "date": "2016-01-01",
            "daily_location_method": "last",
            "aggregation_unit": "admin3",
            "subscriber_subset": "all",
        });
        let mut defaulted = explicit.clone();
        defaulted.as_object_mut().unwrap().remove("subscriber_subset");
        let mut nulled = explicit.clone();
        nulled["subscriber_subset"] = Value::Null;

        let qid = query_id("daily_location", &explicit).unwrap();
        assert_eq!(qid, query_id("daily_location", &defaulted).unwrap());
        assert_eq!(qid, query_id("daily_location", &nulled).unwrap());
    }

    #[test]
    fn test_fingerprint_equal_across_date_formats() {
        let iso = json!({"start": "2016-01-01", "stop": "2016-01-07"});
        let slashed = json!({"start": "2016/01/01", "stop": "2016-01-07T00:00:00"});
        assert_eq!(
            query_id("subscriber_locations", &iso).unwrap(),
            query_id("subscriber_locations", &slashed).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_equal_across_direction_alias() {
        let base = json!({
            "start_date": "2016-01-01",
            "end_date": "2016-01-08",
            "interval": "day",
            "direction": "both",
            "aggregation_unit": "admin3",
        });
        let mut aliased = base.clone();
        aliased["direction"] = json!("all");
        assert_eq!(
            query_id("location_event_counts", &base).unwrap(),
            query_id("location_event_counts", &aliased).unwrap()
        );
    }

    #[test]
    fn test_descriptor_qid_matches_fingerprint() {
        let params = json!({
            "date": "2016-01-01",
            "daily_location_method": "most-common",
            "aggregation_unit": "admin3",
        });
        let descriptor = make_descriptor("daily_location", &params).unwrap();
        assert_eq!(descriptor.qid(), &query_id("daily_location", &params).unwrap());
    }

    #[test]
    fn test_blob_roundtrip_preserves_identity() {
        let params = json!({
            "date": "2016-01-01",
            "daily_location_method": "most-common",
            "aggregation_unit": "admin3",
        });
        let descriptor = make_descriptor("daily_location", &params).unwrap();
        let rebuilt = QueryDescriptor::from_blob(&descriptor.to_blob().unwrap()).unwrap();
        assert_eq!(descriptor.qid(), rebuilt.qid());
        assert_eq!(descriptor.sql(), rebuilt.sql());
    }

    #[test]
    fn test_aggregate_blob_roundtrip() {
        let params = json!({
            "date": "2016-01-01",
            "daily_location_method": "last",
            "aggregation_unit": "admin0",
        });
        let aggregate = make_descriptor("daily_location", &params)
            .unwrap()
            .aggregate()
            .unwrap();
        let rebuilt = QueryDescriptor::from_blob(&aggregate.to_blob().unwrap()).unwrap();
        assert_eq!(aggregate.qid(), rebuilt.qid());
    }

    #[test]
    fn test_validation_error_is_structured() {
        let params = json!({
            "date": "2016-01-01",
            "daily_location_method": "foobar",
            "aggregation_unit": "admin3",
        });
        match make_descriptor("daily_location", &params) {
            Err(FlowError::QueryParamsValidation(messages)) => {
                assert!(messages.0["daily_location_method"][0].contains("one of"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }
}
