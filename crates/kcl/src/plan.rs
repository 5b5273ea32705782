//! The value format boundary.
//!
//! Renders a top-level `Value` to `serde_yaml::Value`/`serde_json::Value`,
//! honoring insertion order,
//! `sort_keys`, `ignore_private`, `ignore_none`, and dot-notation path
//! selectors, ahead of the full doc/format/lint toolchain this crate does
//! not implement.

use crate::{symtable::is_private_field, value::Value};

/// The three planner flags, plus the path selectors applied before
/// serialization.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub sort_keys: bool,
    pub ignore_private: bool,
    pub ignore_none: bool,
    pub path_selectors: Vec<String>,
}

/// Applies `options` to `value` and renders the result as a `serde_yaml::Value`.
/// Strings containing newlines are not given a distinct representation here —
/// `serde_yaml` already picks literal block style for them on serialization.
#[must_use]
pub fn to_yaml(value: &Value, options: &PlanOptions) -> serde_yaml::Value {
    yaml_value(&select(value, options), options)
}

/// Applies `options` to `value` and renders the result as a `serde_json::Value`.
#[must_use]
pub fn to_json(value: &Value, options: &PlanOptions) -> serde_json::Value {
    json_value(&select(value, options), options)
}

/// Applies every dot-notation path selector in turn, each narrowing the
/// planned tree down to the dict/schema attribute chain it names. With no
/// selectors the whole value passes through unchanged.
fn select(value: &Value, options: &PlanOptions) -> Value {
    if options.path_selectors.is_empty() {
        return value.clone();
    }
    let mut out = crate::value::Dict::new();
    for selector in &options.path_selectors {
        if let Some(selected) = select_one(value, selector) {
            out.insert(selector.clone(), selected, crate::ast::ConfigEntryOp::Override);
        }
    }
    Value::Dict(out)
}

fn select_one(value: &Value, path: &str) -> Option<Value> {
    path.split('.').try_fold(value.clone(), |current, segment| match &current {
        Value::Dict(d) => d.get(segment).cloned(),
        Value::Schema(instance) => instance.borrow().attrs.get(segment).cloned(),
        _ => None,
    })
}

fn keep_entry(key: &str, value: &Value, options: &PlanOptions) -> bool {
    if options.ignore_private && is_private_field(key) {
        return false;
    }
    if options.ignore_none && matches!(value, Value::None | Value::Undefined) {
        return false;
    }
    true
}

fn yaml_value(value: &Value, options: &PlanOptions) -> serde_yaml::Value {
    match value {
        Value::Undefined | Value::None => serde_yaml::Value::Null,
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Int(i) => serde_yaml::Value::Number((*i).into()),
        Value::Float(f) => serde_yaml::Value::Number((*f).into()),
        Value::Str(s) => serde_yaml::Value::String(s.to_string()),
        Value::NumberMultiplier(raw, unit) => serde_yaml::Value::String(format!("{raw}{unit}")),
        Value::List(items) => serde_yaml::Value::Sequence(items.iter().map(|v| yaml_value(v, options)).collect()),
        Value::Dict(d) => serde_yaml::Value::Mapping(dict_entries(d.iter(), options).into_iter().map(|(k, v)| (serde_yaml::Value::String(k), yaml_value(&v, options))).collect()),
        Value::Schema(instance) => {
            let instance = instance.borrow();
            serde_yaml::Value::Mapping(
                dict_entries(instance.attrs.iter(), options).into_iter().map(|(k, v)| (serde_yaml::Value::String(k), yaml_value(&v, options))).collect(),
            )
        }
        Value::Function(_) | Value::Closure(_) | Value::BuiltIn(_) | Value::Decorator(_) | Value::CodeObject(_) => serde_yaml::Value::Null,
    }
}

fn json_value(value: &Value, options: &PlanOptions) -> serde_json::Value {
    match value {
        Value::Undefined | Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        Value::NumberMultiplier(raw, unit) => serde_json::Value::String(format!("{raw}{unit}")),
        Value::List(items) => serde_json::Value::Array(items.iter().map(|v| json_value(v, options)).collect()),
        Value::Dict(d) => {
            serde_json::Value::Object(dict_entries(d.iter(), options).into_iter().map(|(k, v)| (k, json_value(&v, options))).collect())
        }
        Value::Schema(instance) => {
            let instance = instance.borrow();
            serde_json::Value::Object(
                dict_entries(instance.attrs.iter(), options).into_iter().map(|(k, v)| (k, json_value(&v, options))).collect(),
            )
        }
        Value::Function(_) | Value::Closure(_) | Value::BuiltIn(_) | Value::Decorator(_) | Value::CodeObject(_) => serde_json::Value::Null,
    }
}

/// Collects the entries that survive `ignore_private`/`ignore_none`,
/// optionally sorted by key.
fn dict_entries<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>, options: &PlanOptions) -> Vec<(String, Value)> {
    let mut kept: Vec<(String, Value)> =
        entries.filter(|(k, v)| keep_entry(k, v, options)).map(|(k, v)| (k.clone(), v.clone())).collect();
    if options.sort_keys {
        kept.sort_by(|a, b| a.0.cmp(&b.0));
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ConfigEntryOp;

    fn dict_value(pairs: &[(&str, Value)]) -> Value {
        let mut d = crate::value::Dict::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone(), ConfigEntryOp::Override);
        }
        Value::Dict(d)
    }

    #[test]
    fn ignore_private_elides_underscore_keys() {
        let value = dict_value(&[("name", Value::str("alice")), ("_secret", Value::Int(1))]);
        let options = PlanOptions { ignore_private: true, ..PlanOptions::default() };
        let yaml = to_yaml(&value, &options);
        assert!(matches!(yaml["_secret"], serde_yaml::Value::Null));
    }

    #[test]
    fn sort_keys_orders_alphabetically() {
        let value = dict_value(&[("b", Value::Int(2)), ("a", Value::Int(1))]);
        let options = PlanOptions { sort_keys: true, ..PlanOptions::default() };
        let yaml = to_yaml(&value, &options);
        let keys: Vec<_> = yaml.as_mapping().unwrap().keys().map(|k| k.as_str().unwrap().to_owned()).collect();
        assert_eq!(keys, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn number_multiplier_serializes_as_canonical_suffix() {
        let value = Value::NumberMultiplier(1, crate::value::NumberUnit::Mebi);
        assert_eq!(to_yaml(&value, &PlanOptions::default()).as_str(), Some("1Mi"));
    }
}
