// Flows: an origin-destination matrix between two daily locations.

use serde_json::Value;

use crate::error::{Result, ValidationMessages};

use super::daily_location;
use super::descriptor::QueryDescriptor;
use super::rules::ParamReader;

pub fn validate(params: &Value) -> std::result::Result<Value, ValidationMessages> {
    let mut reader = ParamReader::new(params)?;
    let from = reader.nested("from_location", daily_location::validate);
    let to = reader.nested("to_location", daily_location::validate);

    if let (Some(from), Some(to)) = (&from, &to) {
        if from["aggregation_unit"] != to["aggregation_unit"] {
            let mut messages = ValidationMessages::default();
            messages.push(
                "to_location.aggregation_unit",
                "Must match from_location.aggregation_unit.",
            );
            return Err(messages);
        }
    }
    reader.finish()
}

pub fn build(params: Value) -> Result<QueryDescriptor> {
    let from = daily_location::build(params["from_location"].clone())?;
    let to = daily_location::build(params["to_location"].clone())?;

    let sql = format!(
        "SELECT from_loc.pcod AS pcod_from, to_loc.pcod AS pcod_to, count(*) AS total \
         FROM {from_table} AS from_loc \
         JOIN {to_table} AS to_loc USING (subscriber) \
         GROUP BY from_loc.pcod, to_loc.pcod",
        from_table = from.qualified_name(),
        to_table = to.qualified_name(),
    );

    Ok(QueryDescriptor::derived(
        "flows",
        params,
        sql,
        vec![from, to],
        false,
    ))
}
