//! JSON parser.
use harbor_core::{
    data_model::{FieldValue, Metric},
    ingest::Parser,
};
use harbor_error::{generic_error, GenericError};
use serde::Deserialize;
use serde_json::{Map, Value};

const DEFAULT_METRIC_NAME: &str = "json";

/// Unit of numeric timestamps in a JSON payload.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    /// Seconds, possibly fractional.
    #[default]
    Seconds,

    /// Milliseconds.
    Milliseconds,

    /// Microseconds.
    Microseconds,

    /// Nanoseconds.
    Nanoseconds,
}

impl TimestampUnit {
    fn to_nanos(self, value: f64) -> Option<u64> {
        let scale = match self {
            Self::Seconds => 1e9,
            Self::Milliseconds => 1e6,
            Self::Microseconds => 1e3,
            Self::Nanoseconds => 1.0,
        };

        let nanos = value * scale;
        if nanos.is_finite() && nanos >= 0.0 && nanos < u64::MAX as f64 {
            Some(nanos as u64)
        } else {
            None
        }
    }
}

/// JSON parser configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JsonConfiguration {
    /// Key whose string value names the metric.
    ///
    /// When unset, or when an object lacks the key, the metric is named `json`.
    #[serde(default, rename = "json_name_key")]
    pub name_key: Option<String>,

    /// Keys whose values become tags rather than fields.
    #[serde(default, rename = "tag_keys")]
    pub tag_keys: Vec<String>,

    /// Keys whose string values become string fields.
    ///
    /// Other string values are ignored.
    #[serde(default, rename = "json_string_fields")]
    pub string_fields: Vec<String>,

    /// Key holding the metric timestamp.
    #[serde(default, rename = "json_time_key")]
    pub timestamp_key: Option<String>,

    /// Unit of the timestamp found under `timestamp_key`.
    #[serde(default, rename = "json_time_unit")]
    pub timestamp_unit: TimestampUnit,
}

/// Parses JSON objects, or arrays of objects, into metrics.
///
/// Nested objects and arrays are flattened, joining keys with `_` (`{"a": {"b": 1}}` becomes the field `a_b`, and
/// `{"a": [1, 2]}` becomes `a_0` and `a_1`). Numbers become float fields and booleans become boolean fields. Strings
/// are only kept when named as tags, string fields, the metric name, or the timestamp. Nulls are ignored. An object
/// that yields no fields produces no metric.
#[derive(Clone, Debug, Default)]
pub struct JsonParser {
    config: JsonConfiguration,
}

impl JsonParser {
    /// Creates a new `JsonParser` from the given configuration.
    pub fn new(config: JsonConfiguration) -> Self {
        Self { config }
    }

    fn parse_object(&self, object: &Map<String, Value>) -> Result<Option<Metric>, GenericError> {
        let mut flattened = Vec::new();
        for (key, value) in object {
            flatten(key.clone(), value, &mut flattened);
        }

        let mut metric = Metric::new(DEFAULT_METRIC_NAME);
        let mut has_fields = false;
        for (key, value) in flattened {
            if self.config.name_key.as_deref() == Some(key.as_str()) {
                if let Value::String(name) = value {
                    metric.set_name(name.as_str());
                    continue;
                }
            }

            if self.config.timestamp_key.as_deref() == Some(key.as_str()) {
                let timestamp = value
                    .as_f64()
                    .and_then(|raw| self.config.timestamp_unit.to_nanos(raw))
                    .ok_or_else(|| generic_error!("Invalid timestamp under key '{}': {}", key, value))?;
                metric.set_timestamp(timestamp);
                continue;
            }

            if self.config.tag_keys.iter().any(|tag_key| *tag_key == key) {
                match value {
                    Value::String(s) => metric.insert_tag(key, s.as_str()),
                    Value::Number(n) => metric.insert_tag(key, n.to_string()),
                    Value::Bool(b) => metric.insert_tag(key, b.to_string()),
                    _ => {}
                }
                continue;
            }

            let field = match value {
                Value::Number(n) => n.as_f64().map(FieldValue::Float),
                Value::Bool(b) => Some(FieldValue::Boolean(*b)),
                Value::String(s) if self.config.string_fields.iter().any(|field| *field == key) => {
                    Some(FieldValue::String(s.clone()))
                }
                _ => None,
            };
            if let Some(field) = field {
                metric = metric.with_field(key, field);
                has_fields = true;
            }
        }

        Ok(has_fields.then_some(metric))
    }
}

impl Parser for JsonParser {
    fn parse(&self, payload: &[u8]) -> Result<Vec<Metric>, GenericError> {
        let document: Value =
            serde_json::from_slice(payload).map_err(|e| generic_error!("Payload is not valid JSON: {}", e))?;

        let objects = match &document {
            Value::Object(object) => vec![object],
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    item.as_object()
                        .ok_or_else(|| generic_error!("Array element {} is not a JSON object.", index))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(generic_error!("Payload must be a JSON object or an array of objects.")),
        };

        let mut metrics = Vec::with_capacity(objects.len());
        for object in objects {
            if let Some(metric) = self.parse_object(object)? {
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }
}

fn flatten<'a>(prefix: String, value: &'a Value, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(object) => {
            for (key, nested) in object {
                flatten(format!("{}_{}", prefix, key), nested, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten(format!("{}_{}", prefix, index), nested, out);
            }
        }
        Value::Null => {}
        _ => out.push((prefix, value)),
    }
}
