// Location event counts: events per location unit per time bucket,
// optionally filtered by direction and event type.

use serde_json::Value;

use crate::error::{Result, ValidationMessages};

use super::descriptor::QueryDescriptor;
use super::raw_table;
use super::rules::ParamReader;
use super::{unit_column, AGGREGATION_UNITS, SUBSCRIBER_SUBSETS};

pub const INTERVALS: &[&str] = &["day", "hour", "min"];
pub const DIRECTIONS: &[&str] = &["in", "out", "both", "all"];

/// Standard event tables unioned when no explicit `event_types` are given.
pub const EVENT_TYPES: &[&str] = &["calls", "sms", "mds", "topups"];

pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
    let mut reader = ParamReader::new(params)?;
    reader.date("start_date");
    reader.date("end_date");
    reader.one_of("interval", INTERVALS);
    if let Some(direction) = reader.one_of("direction", DIRECTIONS) {
        // "all" is a legacy alias; canonicalize before hashing.
        if direction == "all" {
            reader.put("direction", Value::String("both".to_string()));
        }
    }
    if let Some(types) = reader.optional_string_list("event_types") {
        for event_type in &types {
            if !EVENT_TYPES.contains(&event_type.as_str()) {
                let mut messages = ValidationMessages::default();
                messages.push(
                    "event_types",
                    format!("Must be one of: {}.", EVENT_TYPES.join(", ")),
                );
                return Err(messages);
            }
        }
    }
    reader.one_of("aggregation_unit", AGGREGATION_UNITS);
    reader.one_of_or_default("subscriber_subset", SUBSCRIBER_SUBSETS, "all");
    reader.finish()
}

pub fn build(params: Value) -> Result<QueryDescriptor> {
    let start = super::param_str(&params, "start_date")?;
    let end = super::param_str(&params, "end_date")?;
    let interval = super::param_str(&params, "interval")?;
    let direction = super::param_str(&params, "direction")?;
    let unit = super::param_str(&params, "aggregation_unit")?;

    let event_types: Vec<String> = match params["event_types"].as_array() {
        Some(types) => types
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        None => EVENT_TYPES.iter().map(|t| t.to_string()).collect(),
    };

    let mut tables = Vec::with_capacity(event_types.len());
    for event_type in &event_types {
        tables.push(raw_table::events_table(event_type)?);
    }

    let union = tables
        .iter()
        .map(|t| {
            format!(
                "SELECT subscriber, datetime, location_id, outgoing FROM {}",
                t.qualified_name()
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let direction_filter = match direction.as_str() {
        "in" => " AND NOT events.outgoing",
        "out" => " AND events.outgoing",
        _ => "",
    };
    let trunc = if interval == "min" {
        "minute"
    } else {
        interval.as_str()
    };
    let pcod = unit_column(&unit);
    let sql = format!(
        "SELECT cells.{pcod} AS pcod, \
         date_trunc('{trunc}', events.datetime) AS interval_start, count(*) AS total \
         FROM ({union}) AS events \
         JOIN infrastructure.cells AS cells ON events.location_id = cells.id \
         WHERE events.datetime >= '{start}' AND events.datetime < '{end}'{direction_filter} \
         GROUP BY cells.{pcod}, date_trunc('{trunc}', events.datetime)"
    );

    Ok(QueryDescriptor::derived(
        "location_event_counts",
        params,
        sql,
        tables,
        false,
    ))
}
