//! Permissive readers for loosely typed feed values.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::Value as JsonValue;

/// Trimmed non-empty string, or the textual form of a number.
pub fn text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Zero, negative, empty, null and unparsable amounts all count as absent.
pub fn positive_amount(value: &JsonValue) -> Option<f64> {
    number(value).filter(|amount| *amount > 0.0)
}

pub fn integer(value: &JsonValue) -> Option<i32> {
    let raw = number(value)?;
    if raw.fract() != 0.0 {
        return None;
    }
    i32::try_from(raw as i64).ok()
}

pub fn flag(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "1" => Some(true),
            "n" | "no" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Accepts `2025-05-01`, `2025-05-01T00:00:00` and `2025-05-01 00:00:00`.
pub fn date(value: &JsonValue) -> Option<NaiveDate> {
    let raw = text(value)?;
    let day = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Arrays of ids or comma-separated strings; unparsable entries are dropped.
pub fn id_list(value: &JsonValue) -> Vec<i32> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(integer).collect(),
        JsonValue::String(s) => s
            .split(',')
            .filter_map(|part| part.trim().parse::<i32>().ok())
            .collect(),
        JsonValue::Number(_) => integer(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// `{"123": "Miami"}` or `{"123": {"name": "Miami"}}` style id-to-name maps.
pub fn name_map(value: &JsonValue) -> BTreeMap<i32, String> {
    let Some(map) = value.as_object() else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(key, entry)| {
            let id = key.trim().parse::<i32>().ok().filter(|id| *id > 0)?;
            let name = match entry {
                JsonValue::Object(inner) => inner.get("name").and_then(text),
                other => text(other),
            }?;
            Some((id, name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn amounts_accept_numeric_strings_and_reject_zero() {
        assert_eq!(positive_amount(&json!("1,299.00")), Some(1299.0));
        assert_eq!(positive_amount(&json!(0)), None);
        assert_eq!(positive_amount(&json!("")), None);
        assert_eq!(positive_amount(&json!(null)), None);
    }

    #[test]
    fn flags_and_lists_are_lenient() {
        assert_eq!(flag(&json!("Y")), Some(true));
        assert_eq!(flag(&json!(0)), Some(false));
        assert_eq!(id_list(&json!("1, 2,x,3")), vec![1, 2, 3]);
        assert_eq!(id_list(&json!([4, "5"])), vec![4, 5]);
        assert_eq!(
            date(&json!("2025-05-01T00:00:00")),
            NaiveDate::from_ymd_opt(2025, 5, 1)
        );
    }

    #[test]
    fn name_maps_take_nested_names() {
        let names = name_map(&json!({"10": "Miami", "11": {"name": "Nassau"}, "x": "skip"}));
        assert_eq!(names.get(&10).map(String::as_str), Some("Miami"));
        assert_eq!(names.get(&11).map(String::as_str), Some("Nassau"));
        assert_eq!(names.len(), 2);
    }
}
