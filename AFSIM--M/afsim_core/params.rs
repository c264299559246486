use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered parameter bag attached to scenarios, platforms and components.
pub type Params = IndexMap<String, ParamValue>;

/// A single parameter value.
///
/// Serialized untagged, so the JSON form is the plain JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Explicit null.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integral number.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// Free text, rendered verbatim.
    Text(String),
    /// Ordered list of values.
    List(Vec<ParamValue>),
    /// Nested ordered mapping.
    Map(IndexMap<String, ParamValue>),
}

impl ParamValue {
    /// Returns the text payload if this is a string value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Converts back into a JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Integer(num) => Value::from(*num),
            Self::Float(num) => Value::from(*num),
            Self::Text(text) => Value::String(text.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Renders the value as it appears after the key in scenario text.
impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Integer(num) => write!(f, "{num}"),
            Self::Float(num) => f.write_str(&format_float(*num)),
            Self::Text(text) => f.write_str(text),
            Self::List(_) | Self::Map(_) => f.write_str(&self.to_json().to_string()),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(num) => num
                .as_i64()
                .map_or_else(|| Self::Float(num.as_f64().unwrap_or(f64::NAN)), Self::Integer),
            Value::String(text) => Self::Text(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<bool> for ParamValue {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<i64> for ParamValue {
    fn from(num: i64) -> Self {
        Self::Integer(num)
    }
}

impl From<f64> for ParamValue {
    fn from(num: f64) -> Self {
        Self::Float(num)
    }
}

/// Converts a JSON object into a parameter bag; anything else yields `None`.
#[must_use]
pub fn params_from_json(value: &Value) -> Option<Params> {
    value.as_object().map(|map| {
        map.iter()
            .map(|(key, value)| (key.clone(), ParamValue::from(value.clone())))
            .collect()
    })
}

/// Formats a float for scenario text: integral values keep a trailing `.0`.
#[must_use]
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn floats_keep_decimal_point() {
        assert_eq!(format_float(3600.0), "3600.0");
        assert_eq!(format_float(-80.0), "-80.0");
        assert_eq!(format_float(35.1), "35.1");
        assert_eq!(format_float(0.25), "0.25");
    }

    #[test]
    fn json_numbers_keep_their_shape() {
        assert_eq!(ParamValue::from(json!(5)), ParamValue::Integer(5));
        assert_eq!(ParamValue::from(json!(2.5)), ParamValue::Float(2.5));
        assert_eq!(ParamValue::from(json!(5)).to_string(), "5");
        assert_eq!(ParamValue::from(json!(5.0)).to_string(), "5.0");
    }

    #[test]
    fn nested_values_render_as_compact_json() {
        let value = ParamValue::from(json!({ "speed": 250, "units": "kts" }));
        assert_eq!(value.to_string(), r#"{"speed":250,"units":"kts"}"#);
        assert_eq!(ParamValue::from(true).to_string(), "true");
    }

    #[test]
    fn params_preserve_insertion_order() {
        let params = params_from_json(&json!({ "zeta": 1, "alpha": "x" })).unwrap();
        let decoded: Params = serde_json::from_value(json!({ "zeta": 1, "alpha": "x" })).unwrap();
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(decoded, params);
        assert!(params_from_json(&json!([1, 2])).is_none());
    }
}
