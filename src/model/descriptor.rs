//! Event descriptors: the validated shape of an "object changed" notification.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A validated event descriptor.
///
/// Carries the untouched JSON it was parsed from (stored as the task payload)
/// alongside the typed identifiers the fingerprint is computed over.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDescriptor {
    objects: Vec<String>,
    rev: u64,
    extra: Map<String, Value>,
    raw: Value,
}

impl EventDescriptor {
    /// Validate a raw JSON body.
    ///
    /// Requires an object with `object` (string, integer, or a non-empty array
    /// of those) and `rev` (non-negative integer or decimal-digit string).
    /// Every other field is kept as-is.
    pub fn from_json(raw: Value) -> Result<Self> {
        let Value::Object(fields) = &raw else {
            return Err(Error::Validation(
                "descriptor must be a JSON object".to_string(),
            ));
        };

        let objects = match fields.get("object") {
            None | Some(Value::Null) => {
                return Err(Error::Validation("missing field `object`".to_string()));
            }
            Some(Value::Array(items)) if items.is_empty() => {
                return Err(Error::Validation(
                    "`object` must not be an empty array".to_string(),
                ));
            }
            Some(Value::Array(items)) => items
                .iter()
                .map(object_id)
                .collect::<Result<Vec<_>>>()?,
            Some(single) => vec![object_id(single)?],
        };

        let rev = match fields.get("rev") {
            None | Some(Value::Null) => {
                return Err(Error::Validation("missing field `rev`".to_string()));
            }
            Some(value) => revision(value)?,
        };

        let extra = fields
            .iter()
            .filter(|(k, _)| k.as_str() != "object" && k.as_str() != "rev")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut objects = objects;
        objects.sort();
        objects.dedup();

        Ok(Self {
            objects,
            rev,
            extra,
            raw,
        })
    }

    /// Object identifiers, sorted and de-duplicated.
    pub fn objects(&self) -> &[String] {
        &self.objects
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    /// Fields other than `object` and `rev`.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// The JSON body exactly as received.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }
}

fn object_id(value: &Value) -> Result<String> {
    match value {
        Value::String(s) if s.trim().is_empty() => Err(Error::Validation(
            "`object` identifiers must not be blank".to_string(),
        )),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => integral(n)
            .map(|i| i.to_string())
            .ok_or_else(|| Error::Validation(format!("`object` identifier {n} is not an integer"))),
        other => Err(Error::Validation(format!(
            "`object` identifiers must be strings or integers, got {}",
            type_name(other)
        ))),
    }
}

fn revision(value: &Value) -> Result<u64> {
    let rev = match value {
        Value::Number(n) => integral(n).and_then(|i| u64::try_from(i).ok()),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse::<u64>().ok()
        }
        _ => None,
    };
    rev.ok_or_else(|| {
        Error::Validation(format!(
            "`rev` must be a non-negative integer, got {value}"
        ))
    })
}

/// Integer value of a JSON number, accepting integral floats like `3.0`.
pub(crate) fn integral(n: &serde_json::Number) -> Option<i128> {
    if let Some(i) = n.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(i128::from(u));
    }
    let f = n.as_f64()?;
    // Beyond 2^53 a float no longer identifies a single integer.
    (f.fract() == 0.0 && f.abs() <= 9_007_199_254_740_992.0).then_some(f as i128)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_descriptor() {
        let d = EventDescriptor::from_json(json!({"object": "A", "rev": 1})).unwrap();
        assert_eq!(d.objects(), ["A".to_string()]);
        assert_eq!(d.rev(), 1);
        assert!(d.extra().is_empty());
    }

    #[test]
    fn keeps_raw_payload_untouched() {
        let raw = json!({"rev": "7", "object": [3, "b", 3], "source": "uploader"});
        let d = EventDescriptor::from_json(raw.clone()).unwrap();
        assert_eq!(d.raw(), &raw);
        assert_eq!(d.objects(), ["3".to_string(), "b".to_string()]);
        assert_eq!(d.rev(), 7);
        assert_eq!(d.extra().get("source"), Some(&json!("uploader")));
    }

    #[test]
    fn rejects_non_object_body() {
        let err = EventDescriptor::from_json(json!(["A", 1])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(EventDescriptor::from_json(json!({"rev": 1})).is_err());
        assert!(EventDescriptor::from_json(json!({"object": "A"})).is_err());
        assert!(EventDescriptor::from_json(json!({"object": null, "rev": 1})).is_err());
    }

    #[test]
    fn rejects_bad_identifiers() {
        for object in [json!(""), json!("  "), json!([]), json!(1.5), json!(true), json!({"a": 1})] {
            let err = EventDescriptor::from_json(json!({"object": object, "rev": 1})).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "accepted {object}");
        }
    }

    #[test]
    fn rejects_bad_revisions() {
        for rev in [json!(-1), json!(1.25), json!("1a"), json!(""), json!([1])] {
            let err = EventDescriptor::from_json(json!({"object": "A", "rev": rev})).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "accepted {rev}");
        }
    }

    #[test]
    fn integral_floats_are_integers() {
        let d = EventDescriptor::from_json(json!({"object": 42.0, "rev": 2.0})).unwrap();
        assert_eq!(d.objects(), ["42".to_string()]);
        assert_eq!(d.rev(), 2);
    }
}
