// Declarative field rules for query parameter validation.
//
// Each query kind validates its parameters through a `ParamReader`, which
// checks field rules, collects every failure into the per-field message
// tree, and assembles the canonical parameter mapping (defaults filled,
// dates normalized) that feeds the fingerprint.

use serde_json::{Map, Value};

use crate::error::ValidationMessages;
use crate::identity::parse_datestring;

pub const MISSING: &str = "Missing data for required field.";

/// Reads raw parameters field by field, accumulating failures and the
/// canonical output mapping.
pub struct ParamReader<'a> {
    raw: &'a Map<String, Value>,
    messages: ValidationMessages,
    canonical: Map<String, Value>,
}

impl<'a> ParamReader<'a> {
    /// Fails immediately when the body is not a JSON object.
    pub fn new(params: &'a Value) -> Result<Self, ValidationMessages> {
        match params.as_object() {
            Some(raw) => Ok(Self {
                raw,
                messages: ValidationMessages::default(),
                canonical: Map::new(),
            }),
            None => {
                let mut messages = ValidationMessages::default();
                messages.push("_params", "Parameters must be a mapping.");
                Err(messages)
            }
        }
    }

    fn fail(&mut self, field: &str, message: impl Into<String>) {
        self.messages.push(field, message);
    }

    /// Required ISO date, normalized to `YYYY-MM-DD` in the canonical output.
    pub fn date(&mut self, field: &str) -> Option<String> {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.fail(field, MISSING);
                None
            }
            Some(Value::String(raw)) => match parse_datestring(raw) {
                Some(date) => {
                    let normalized = date.format("%Y-%m-%d").to_string();
                    self.canonical
                        .insert(field.to_string(), Value::String(normalized.clone()));
                    Some(normalized)
                }
                None => {
                    self.fail(field, "Not a valid date.");
                    None
                }
            },
            Some(_) => {
                self.fail(field, "Not a valid date.");
                None
            }
        }
    }

    /// Required string drawn from a closed set.
    pub fn one_of(&mut self, field: &str, allowed: &[&str]) -> Option<String> {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.fail(field, MISSING);
                None
            }
            Some(Value::String(raw)) if allowed.contains(&raw.as_str()) => {
                self.canonical
                    .insert(field.to_string(), Value::String(raw.clone()));
                Some(raw.clone())
            }
            Some(_) => {
                self.fail(field, format!("Must be one of: {}.", allowed.join(", ")));
                None
            }
        }
    }

    /// Optional string drawn from a closed set; absent or null canonicalizes
    /// to `default` (which must itself be in the set).
    pub fn one_of_or_default(&mut self, field: &str, allowed: &[&str], default: &str) -> String {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.canonical
                    .insert(field.to_string(), Value::String(default.to_string()));
                default.to_string()
            }
            Some(Value::String(raw)) if allowed.contains(&raw.as_str()) => {
                self.canonical
                    .insert(field.to_string(), Value::String(raw.clone()));
                raw.clone()
            }
            Some(_) => {
                self.fail(field, format!("Must be one of: {}.", allowed.join(", ")));
                default.to_string()
            }
        }
    }

    /// Required non-empty string.
    pub fn non_empty_string(&mut self, field: &str) -> Option<String> {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.fail(field, MISSING);
                None
            }
            Some(Value::String(raw)) if !raw.is_empty() => {
                self.canonical
                    .insert(field.to_string(), Value::String(raw.clone()));
                Some(raw.clone())
            }
            Some(_) => {
                self.fail(field, "Shorter than minimum length 1.");
                None
            }
        }
    }

    /// Optional non-empty list of strings; absent, null, or `[]` canonicalize
    /// to null (meaning "all").
    pub fn optional_string_list(&mut self, field: &str) -> Option<Vec<String>> {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.canonical.insert(field.to_string(), Value::Null);
                None
            }
            Some(Value::Array(items)) => {
                if items.is_empty() {
                    self.canonical.insert(field.to_string(), Value::Null);
                    return None;
                }
                let mut strings = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => strings.push(s.to_string()),
                        None => {
                            self.fail(field, "Not a valid list of strings.");
                            return None;
                        }
                    }
                }
                self.canonical.insert(
                    field.to_string(),
                    Value::Array(strings.iter().cloned().map(Value::String).collect()),
                );
                Some(strings)
            }
            Some(_) => {
                self.fail(field, "Not a valid list of strings.");
                None
            }
        }
    }

    /// Required list of exactly `len` numbers.
    pub fn number_list(&mut self, field: &str, len: usize) {
        match self.raw.get(field) {
            None | Some(Value::Null) => self.fail(field, MISSING),
            Some(Value::Array(items)) => {
                if items.len() != len {
                    self.fail(field, format!("Length must be {len}."));
                    return;
                }
                if items.iter().any(|v| !v.is_number()) {
                    self.fail(field, "Not a valid list of numbers.");
                    return;
                }
                self.canonical
                    .insert(field.to_string(), Value::Array(items.clone()));
            }
            Some(_) => self.fail(field, "Not a valid list of numbers."),
        }
    }

    /// Required mapping whose keys must exactly match `keys` when given.
    pub fn mapping(&mut self, field: &str, keys: Option<&[&str]>) -> Option<Map<String, Value>> {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.fail(field, MISSING);
                None
            }
            Some(Value::Object(object)) => {
                if let Some(keys) = keys {
                    let mut expected: Vec<&str> = keys.to_vec();
                    expected.sort_unstable();
                    let mut actual: Vec<&str> = object.keys().map(String::as_str).collect();
                    actual.sort_unstable();
                    if expected != actual {
                        self.fail(field, format!("Keys must be exactly: {}.", keys.join(", ")));
                        return None;
                    }
                }
                self.canonical
                    .insert(field.to_string(), Value::Object(object.clone()));
                Some(object.clone())
            }
            Some(_) => {
                self.fail(field, "Not a valid mapping.");
                None
            }
        }
    }

    /// Nested sub-parameters validated by another kind's rules, merged into
    /// the canonical output under `field` with the sub-messages prefixed.
    pub fn nested(
        &mut self,
        field: &str,
        validate: fn(&Value) -> Result<Value, ValidationMessages>,
    ) -> Option<Value> {
        match self.raw.get(field) {
            None | Some(Value::Null) => {
                self.fail(field, MISSING);
                None
            }
            Some(raw) => match validate(raw) {
                Ok(canonical) => {
                    self.canonical.insert(field.to_string(), canonical.clone());
                    Some(canonical)
                }
                Err(nested) => {
                    self.messages.merge_nested(field, nested);
                    None
                }
            },
        }
    }

    /// Insert a canonical value directly, for fields with bespoke rules.
    pub fn put(&mut self, field: &str, value: Value) {
        self.canonical.insert(field.to_string(), value);
    }

    /// Finish: the canonical mapping, or every collected failure.
    pub fn finish(self) -> Result<Value, ValidationMessages> {
        if self.messages.is_empty() {
            Ok(Value::Object(self.canonical))
        } else {
            Err(self.messages)
        }
    }
}
