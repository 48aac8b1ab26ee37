// Meaningful locations: label-scored subscriber locations, exposed as a
// per-unit aggregate and two origin-destination matrices (between labels in
// one window, or between two date windows for one label).

use serde_json::Value;

use crate::error::{Result, ValidationMessages};

use super::descriptor::QueryDescriptor;
use super::rules::ParamReader;
use super::{subscriber_locations, unit_column, AGGREGATION_UNITS, SUBSCRIBER_SUBSETS};

pub const DAYS_OF_WEEK: &[&str] = &[
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Rules shared by all three meaningful-locations kinds.
fn common_fields(reader: &mut ParamReader<'_>) {
    reader.number_list("tower_hour_of_day_scores", 24);
    reader.mapping("tower_day_of_week_scores", Some(DAYS_OF_WEEK));
    reader.mapping("labels", None);
    reader.one_of("aggregation_unit", AGGREGATION_UNITS);
    reader.one_of_or_default("subscriber_subset", SUBSCRIBER_SUBSETS, "all");
}

pub mod aggregate {
    use super::*;

    pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
        let mut reader = ParamReader::new(params)?;
        reader.date("start_date");
        reader.date("stop_date");
        reader.non_empty_string("label");
        common_fields(&mut reader);
        reader.finish()
    }

    pub fn build(params: Value) -> Result<QueryDescriptor> {
        let start = crate::queries::param_str(&params, "start_date")?;
        let stop = crate::queries::param_str(&params, "stop_date")?;
        let label = crate::queries::param_str(&params, "label")?;
        let unit = crate::queries::param_str(&params, "aggregation_unit")?;

        let trace = trace_for(&start, &stop)?;
        let pcod = unit_column(&unit);
        let sql = format!(
            "SELECT '{label}' AS label, {pcod} AS pcod, count(*) AS total \
             FROM {trace} GROUP BY {pcod}",
            trace = trace.qualified_name(),
        );

        Ok(QueryDescriptor::derived(
            "meaningful_locations_aggregate",
            params,
            sql,
            vec![trace],
            false,
        ))
    }
}

pub mod between_label_od_matrix {
    use super::*;

    pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
        let mut reader = ParamReader::new(params)?;
        reader.date("start_date");
        reader.date("stop_date");
        reader.non_empty_string("label_a");
        reader.non_empty_string("label_b");
        common_fields(&mut reader);
        reader.finish()
    }

    pub fn build(params: Value) -> Result<QueryDescriptor> {
        let start = crate::queries::param_str(&params, "start_date")?;
        let stop = crate::queries::param_str(&params, "stop_date")?;
        let label_a = crate::queries::param_str(&params, "label_a")?;
        let label_b = crate::queries::param_str(&params, "label_b")?;
        let unit = crate::queries::param_str(&params, "aggregation_unit")?;

        let trace = trace_for(&start, &stop)?;
        let pcod = unit_column(&unit);
        let sql = format!(
            "SELECT '{label_a}' AS label_from, '{label_b}' AS label_to, \
             a.{pcod} AS pcod_from, b.{pcod} AS pcod_to, count(*) AS total \
             FROM {trace} AS a JOIN {trace} AS b USING (subscriber) \
             GROUP BY a.{pcod}, b.{pcod}",
            trace = trace.qualified_name(),
        );

        Ok(QueryDescriptor::derived(
            "meaningful_locations_between_label_od_matrix",
            params,
            sql,
            vec![trace],
            false,
        ))
    }
}

pub mod between_dates_od_matrix {
    use super::*;

    pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
        let mut reader = ParamReader::new(params)?;
        reader.date("start_date_a");
        reader.date("stop_date_a");
        reader.date("start_date_b");
        reader.date("stop_date_b");
        reader.non_empty_string("label");
        common_fields(&mut reader);
        reader.finish()
    }

    pub fn build(params: Value) -> Result<QueryDescriptor> {
        let start_a = crate::queries::param_str(&params, "start_date_a")?;
        let stop_a = crate::queries::param_str(&params, "stop_date_a")?;
        let start_b = crate::queries::param_str(&params, "start_date_b")?;
        let stop_b = crate::queries::param_str(&params, "stop_date_b")?;
        let unit = crate::queries::param_str(&params, "aggregation_unit")?;

        let trace_a = trace_for(&start_a, &stop_a)?;
        let trace_b = trace_for(&start_b, &stop_b)?;
        let pcod = unit_column(&unit);
        let sql = format!(
            "SELECT a.{pcod} AS pcod_from, b.{pcod} AS pcod_to, count(*) AS total \
             FROM {trace_a} AS a JOIN {trace_b} AS b USING (subscriber) \
             GROUP BY a.{pcod}, b.{pcod}",
            trace_a = trace_a.qualified_name(),
            trace_b = trace_b.qualified_name(),
        );

        Ok(QueryDescriptor::derived(
            "meaningful_locations_between_dates_od_matrix",
            params,
            sql,
            vec![trace_a, trace_b],
            false,
        ))
    }
}

fn trace_for(start: &str, stop: &str) -> Result<QueryDescriptor> {
    let params = subscriber_locations::window_params(start, stop);
    subscriber_locations::build(subscriber_locations::validate(&params)?)
}
