// Modal location: the most frequent daily location of each subscriber over
// a date range. Built by stitching one daily location per day and taking the
// mode.

use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};

use crate::error::{FlowError, Result, ValidationMessages};
use crate::identity::parse_datestring;

use super::descriptor::QueryDescriptor;
use super::rules::ParamReader;
use super::{daily_location, AGGREGATION_UNITS, SUBSCRIBER_SUBSETS};

pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
    let mut reader = ParamReader::new(params)?;
    let start = reader.date("start_date");
    let end = reader.date("end_date");
    reader.one_of("daily_location_method", daily_location::METHODS);
    reader.one_of("aggregation_unit", AGGREGATION_UNITS);
    reader.one_of_or_default("subscriber_subset", SUBSCRIBER_SUBSETS, "all");

    if let (Some(start), Some(end)) = (&start, &end) {
        if start > end {
            let mut messages = ValidationMessages::default();
            messages.push("end_date", "Must not be before start_date.");
            return Err(messages);
        }
    }
    reader.finish()
}

fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    let days = (end - start).num_days();
    (0..=days).map(move |offset| start + Duration::days(offset))
}

pub fn build(params: Value) -> Result<QueryDescriptor> {
    let start = super::param_str(&params, "start_date")?;
    let end = super::param_str(&params, "end_date")?;
    let method = super::param_str(&params, "daily_location_method")?;
    let unit = super::param_str(&params, "aggregation_unit")?;
    let subset = super::param_str(&params, "subscriber_subset")?;

    let start = parse_datestring(&start)
        .ok_or_else(|| FlowError::Configuration(format!("uncanonical date '{start}'")))?;
    let end = parse_datestring(&end)
        .ok_or_else(|| FlowError::Configuration(format!("uncanonical date '{end}'")))?;

    let mut days = Vec::new();
    for day in date_range(start, end) {
        let day_params = json!({
            "date": day.format("%Y-%m-%d").to_string(),
            "daily_location_method": method,
            "aggregation_unit": unit,
            "subscriber_subset": subset,
        });
        days.push(daily_location::build(day_params)?);
    }

    let union = days
        .iter()
        .map(|dl| format!("SELECT subscriber, pcod FROM {}", dl.qualified_name()))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let sql = format!(
        "SELECT subscriber, pcod FROM \
         (SELECT subscriber, pcod, \
          row_number() OVER (PARTITION BY subscriber ORDER BY count(*) DESC) AS rn \
          FROM ({union}) days GROUP BY subscriber, pcod) ranked \
         WHERE rn = 1"
    );

    Ok(QueryDescriptor::derived(
        "modal_location",
        params,
        sql,
        days,
        true,
    ))
}
