//! Changesets: merge a partial update into an existing record and validate it,
//! without touching storage.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

/// Outcome of validating `existing` merged with new attributes.
///
/// `data` is always the merge, valid or not, so a form can redisplay what the
/// user typed next to the errors.
#[derive(Debug, Clone, Serialize)]
#[serde(bound = "")]
pub struct Changeset<T> {
    pub action: Option<String>,
    pub data: Map<String, Value>,
    pub changes: Map<String, Value>,
    pub valid: bool,
    pub errors: BTreeMap<String, String>,
    #[serde(skip)]
    record: Option<T>,
}

impl<T> Changeset<T>
where
    T: Serialize + DeserializeOwned + Default + Validate,
{
    pub fn new(existing: &T, attrs: impl Serialize, action: Option<&str>) -> Self {
        let previous = to_object(existing);
        let mut data = previous.clone();
        data.extend(to_object(&attrs));

        let changes: Map<String, Value> = data
            .iter()
            .filter(|(field, value)| previous.get(field.as_str()) != Some(*value))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();

        let mut errors = BTreeMap::new();

        // Decode each change on top of the defaults so a type error lands on
        // its own field and the rest can still be validated.
        let defaults = to_object(&T::default());
        let mut decodable = previous;
        for (field, value) in &changes {
            let mut probe = defaults.clone();
            probe.insert(field.clone(), value.clone());
            if serde_json::from_value::<T>(Value::Object(probe)).is_ok() {
                decodable.insert(field.clone(), value.clone());
            } else {
                errors.insert(field.clone(), "is invalid".to_string());
            }
        }

        let record = match serde_json::from_value::<T>(Value::Object(decodable)) {
            Ok(record) => Some(record),
            Err(e) => {
                errors
                    .entry("base".to_string())
                    .or_insert_with(|| e.to_string());
                None
            }
        };

        if let Some(Err(failures)) = record.as_ref().map(Validate::validate) {
            for (field, kind) in failures.errors() {
                if let Some(message) = first_message(kind) {
                    errors.entry(field.to_string()).or_insert(message);
                }
            }
            if errors.is_empty() {
                errors.insert("base".to_string(), "is invalid".to_string());
            }
        }

        let valid = errors.is_empty();
        Self {
            action: action.map(str::to_string),
            data,
            changes,
            valid,
            errors,
            record: if valid { record } else { None },
        }
    }
}

impl<T> Changeset<T> {
    /// The typed record, only when every field validated.
    pub fn record(&self) -> Option<&T> {
        self.record.as_ref()
    }

    pub fn into_record(self) -> Option<T> {
        self.record
    }

    pub fn error_for(&self, field: &str) -> Option<&str> {
        self.errors.get(field).map(String::as_str)
    }

    /// Errors stay hidden on a pristine form, i.e. until an action is set.
    pub fn visible_error(&self, field: &str) -> Option<&str> {
        self.action.as_ref().and_then(|_| self.error_for(field))
    }
}

fn to_object(value: &impl Serialize) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!(kind = %value_kind(&other), "changeset input is not an object, ignoring");
            Map::new()
        }
        Err(e) => {
            warn!(error = %e, "changeset input failed to serialize, ignoring");
            Map::new()
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// First message under a top-level field. Nested struct and list errors are
/// prefixed with their path inside the field, e.g. `city: has invalid length`.
fn first_message(kind: &ValidationErrorsKind) -> Option<String> {
    match kind {
        ValidationErrorsKind::Field(errors) => errors.first().map(describe),
        ValidationErrorsKind::Struct(nested) => first_nested(nested, ""),
        ValidationErrorsKind::List(items) => items
            .iter()
            .find_map(|(index, nested)| first_nested(nested, &format!("[{index}]"))),
    }
}

fn first_nested(errors: &ValidationErrors, prefix: &str) -> Option<String> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    fields.into_iter().find_map(|(field, kind)| {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(errors) => {
                errors.first().map(|e| format!("{path}: {}", describe(e)))
            }
            ValidationErrorsKind::Struct(nested) => first_nested(nested, &path),
            ValidationErrorsKind::List(items) => items
                .iter()
                .find_map(|(index, nested)| first_nested(nested, &format!("{path}[{index}]"))),
        }
    })
}

fn describe(error: &ValidationError) -> String {
    if let Some(message) = &error.message {
        return message.to_string();
    }
    match &*error.code {
        "length" => "has invalid length".to_string(),
        "email" => "must be a valid email".to_string(),
        "range" => "is out of range".to_string(),
        "required" => "can't be blank".to_string(),
        "url" => "must be a valid URL".to_string(),
        "must_match" => "does not match".to_string(),
        "regex" => "has invalid format".to_string(),
        code => format!("is invalid ({})", code),
    }
}
