// Subscriber location traces: every located event per subscriber inside a
// date window. The base query most location kinds build on.

use serde_json::{json, Value};

use crate::error::{Result, ValidationMessages};

use super::descriptor::QueryDescriptor;
use super::raw_table;
use super::rules::ParamReader;

pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
    let mut reader = ParamReader::new(params)?;
    reader.date("start");
    reader.date("stop");
    reader.finish()
}

pub fn build(params: Value) -> Result<QueryDescriptor> {
    let start = super::param_str(&params, "start")?;
    let stop = super::param_str(&params, "stop")?;
    let calls = raw_table::events_table("calls")?;

    let sql = format!(
        "SELECT calls.subscriber, calls.datetime AS event_time, \
         cells.admin0pcod, cells.admin1pcod, cells.admin2pcod, cells.admin3pcod \
         FROM {calls_table} AS calls \
         JOIN infrastructure.cells AS cells ON calls.location_id = cells.id \
         WHERE calls.datetime >= '{start}' AND calls.datetime < '{stop}'",
        calls_table = calls.qualified_name(),
    );

    Ok(QueryDescriptor::derived(
        "subscriber_locations",
        params,
        sql,
        vec![calls],
        false,
    ))
}

/// Canonical parameters for the trace underlying a one-day window.
pub fn window_params(start: &str, stop: &str) -> Value {
    json!({ "start": start, "stop": stop })
}
