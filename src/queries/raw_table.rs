// The base `table` kind: a raw events table that already exists in the
// warehouse. Raw tables get catalog records so dependency edges can point at
// them, but they are never scored and never evicted.

use serde_json::Value;

use crate::error::{Result, ValidationMessages};

use super::descriptor::QueryDescriptor;
use super::rules::ParamReader;

pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
    let mut reader = ParamReader::new(params)?;
    if let Some(name) = reader.non_empty_string("name") {
        if !name.starts_with("events.") || name.len() <= "events.".len() {
            let mut messages = ValidationMessages::default();
            messages.push("name", "Must be a qualified events table.");
            return Err(messages);
        }
    }
    reader.finish()
}

pub fn build(params: Value) -> Result<QueryDescriptor> {
    let name = super::param_str(&params, "name")?;
    let (schema, table) = name
        .split_once('.')
        .ok_or_else(|| crate::error::FlowError::Configuration(format!("unqualified table {name}")))?;
    Ok(QueryDescriptor::raw_table(params.clone(), schema, table))
}

/// Descriptor for one of the standard event tables, used by builders that
/// depend on raw events.
pub fn events_table(event_type: &str) -> Result<QueryDescriptor> {
    build(serde_json::json!({ "name": format!("events.{event_type}") }))
}
