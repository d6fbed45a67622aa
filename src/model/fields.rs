use crate::tree_store::is_valid_key;
use serde_json::Value;

/// First of `names` present on `node`, ignoring nulls.
pub(crate) fn first_field<'a>(node: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| node.get(*name))
        .find(|value| !value.is_null())
}

/// A reference to another record: a non-empty key string or a positive integer.
pub(crate) fn reference(value: Option<&Value>) -> Option<String> {
    let key = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => match n.as_u64() {
            Some(0) | None => return None,
            Some(id) => id.to_string(),
        },
        _ => return None,
    };
    is_valid_key(&key).then_some(key)
}

pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn number(value: Option<&Value>) -> Option<f64> {
    let parsed: Option<f64> = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reference_accepts_keys_and_ids() {
        assert_eq!(reference(Some(&json!("p1"))), Some("p1".to_string()));
        assert_eq!(reference(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(reference(Some(&json!(""))), None);
        assert_eq!(reference(Some(&json!(0))), None);
        assert_eq!(reference(Some(&json!("a/b"))), None);
        assert_eq!(reference(Some(&json!(null))), None);
        assert_eq!(reference(None), None);
    }

    #[test]
    fn first_field_skips_nulls() {
        let node = json!({"icon": null, "category": "garden"});
        assert_eq!(
            first_field(&node, &["icon", "category"]),
            Some(&json!("garden"))
        );
    }

    #[test]
    fn number_parses_strings() {
        assert_eq!(number(Some(&json!("2.5"))), Some(2.5));
        assert_eq!(number(Some(&json!(3))), Some(3.0));
        assert_eq!(number(Some(&json!("far"))), None);
    }
}
