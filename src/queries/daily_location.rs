// Daily location: one location per subscriber per day, at a chosen
// aggregation unit, by the `last` or `most-common` method.

use chrono::Duration;
use serde_json::Value;

use crate::error::{FlowError, Result, ValidationMessages};
use crate::identity::parse_datestring;

use super::descriptor::QueryDescriptor;
use super::rules::ParamReader;
use super::{subscriber_locations, unit_column, AGGREGATION_UNITS, SUBSCRIBER_SUBSETS};

pub const METHODS: &[&str] = &["last", "most-common"];

pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
    let mut reader = ParamReader::new(params)?;
    reader.date("date");
    reader.one_of("daily_location_method", METHODS);
    reader.one_of("aggregation_unit", AGGREGATION_UNITS);
    reader.one_of_or_default("subscriber_subset", SUBSCRIBER_SUBSETS, "all");
    reader.finish()
}

pub fn build(params: Value) -> Result<QueryDescriptor> {
    let date = super::param_str(&params, "date")?;
    let method = super::param_str(&params, "daily_location_method")?;
    let unit = super::param_str(&params, "aggregation_unit")?;

    let day = parse_datestring(&date)
        .ok_or_else(|| FlowError::Configuration(format!("uncanonical date '{date}'")))?;
    let next_day = (day + Duration::days(1)).format("%Y-%m-%d").to_string();
    let trace_params = subscriber_locations::window_params(&date, &next_day);
    let trace = subscriber_locations::build(subscriber_locations::validate(&trace_params)?)?;

    let pcod = unit_column(&unit);
    let trace_table = trace.qualified_name();
    let sql = match method.as_str() {
        "last" => format!(
            "SELECT DISTINCT ON (subscriber) subscriber, {pcod} AS pcod \
             FROM {trace_table} ORDER BY subscriber, event_time DESC"
        ),
        _ => format!(
            "SELECT subscriber, pcod FROM \
             (SELECT subscriber, {pcod} AS pcod, \
              row_number() OVER (PARTITION BY subscriber ORDER BY count(*) DESC) AS rn \
              FROM {trace_table} GROUP BY subscriber, {pcod}) ranked \
             WHERE rn = 1"
        ),
    };

    Ok(QueryDescriptor::derived(
        "daily_location",
        params,
        sql,
        vec![trace],
        true,
    ))
}
