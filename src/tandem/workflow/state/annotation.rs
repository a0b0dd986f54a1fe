// SPDX-License-Identifier: MIT

//! Annotations: per-field defaults and reducers

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::store::GraphState;

/// Custom merge function `(current, update) -> merged`
pub type ReducerFn = Arc<dyn Fn(&Value, Value) -> Value + Send + Sync>;

type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Supported field types
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Whether `value` is an acceptable update for this type (null always is)
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// Merge rule applied to successive updates of one field
#[derive(Clone, Default)]
pub enum Reducer {
    /// Replace the value (default)
    #[default]
    Replace,
    /// Append to array; array updates are extended, scalars pushed
    Append,
    /// Shallow-merge objects
    Merge,
    /// Arrays of objects keyed by the named field; matching items are
    /// shallow-merged in place, new items appended
    MergeById(String),
    /// Keep maximum value
    Max,
    /// Keep minimum value
    Min,
    /// Add numbers
    Sum,
    /// Logical or
    Or,
    /// Logical and
    And,
    /// Replace unless the update is null
    IfDefined,
    /// User-supplied merge
    Custom(ReducerFn),
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Replace => write!(f, "Replace"),
            Reducer::Append => write!(f, "Append"),
            Reducer::Merge => write!(f, "Merge"),
            Reducer::MergeById(key) => write!(f, "MergeById({key})"),
            Reducer::Max => write!(f, "Max"),
            Reducer::Min => write!(f, "Min"),
            Reducer::Sum => write!(f, "Sum"),
            Reducer::Or => write!(f, "Or"),
            Reducer::And => write!(f, "And"),
            Reducer::IfDefined => write!(f, "IfDefined"),
            Reducer::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Reducer {
    /// Merge `update` into `current`, returning the new value
    pub fn merge(&self, current: &Value, update: Value) -> Value {
        match self {
            Reducer::Replace => update,
            Reducer::Append => {
                let mut items = match current {
                    Value::Array(a) => a.clone(),
                    _ => Vec::new(),
                };
                match update {
                    Value::Array(new_items) => items.extend(new_items),
                    other => items.push(other),
                }
                Value::Array(items)
            }
            Reducer::Merge => match (current, update) {
                (Value::Object(current_obj), Value::Object(new_obj)) => {
                    let mut merged = current_obj.clone();
                    for (k, v) in new_obj {
                        merged.insert(k, v);
                    }
                    Value::Object(merged)
                }
                (_, Value::Object(new_obj)) => Value::Object(new_obj),
                (current, _) => current.clone(),
            },
            Reducer::MergeById(key) => merge_by_id(current, update, key),
            Reducer::Max => pick_number(current, update, |new, cur| new > cur),
            Reducer::Min => pick_number(current, update, |new, cur| new < cur),
            Reducer::Sum => sum_numbers(current, &update),
            Reducer::Or => {
                Value::Bool(current.as_bool().unwrap_or(false) || update.as_bool().unwrap_or(false))
            }
            Reducer::And => {
                let new = update.as_bool().unwrap_or(false);
                match current.as_bool() {
                    Some(cur) => Value::Bool(cur && new),
                    None => Value::Bool(new),
                }
            }
            Reducer::IfDefined => {
                if update.is_null() {
                    current.clone()
                } else {
                    update
                }
            }
            Reducer::Custom(f) => f(current, update),
        }
    }
}

fn merge_by_id(current: &Value, update: Value, key: &str) -> Value {
    let mut items = match current {
        Value::Array(a) => a.clone(),
        _ => Vec::new(),
    };
    let incoming = match update {
        Value::Array(a) => a,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    for item in incoming {
        let existing = item.get(key).and_then(|id| {
            items
                .iter()
                .position(|candidate| candidate.get(key) == Some(id))
        });
        match (existing, item) {
            (Some(idx), Value::Object(new_obj)) => {
                if let Value::Object(target) = &mut items[idx] {
                    for (k, v) in new_obj {
                        target.insert(k, v);
                    }
                } else {
                    items[idx] = Value::Object(new_obj);
                }
            }
            (Some(idx), other) => items[idx] = other,
            (None, other) => items.push(other),
        }
    }
    Value::Array(items)
}

fn pick_number(current: &Value, update: Value, better: fn(f64, f64) -> bool) -> Value {
    match (current.as_f64(), update.as_f64()) {
        (_, None) => current.clone(),
        (None, Some(_)) => update,
        (Some(cur), Some(new)) => {
            if better(new, cur) {
                update
            } else {
                current.clone()
            }
        }
    }
}

fn sum_numbers(current: &Value, update: &Value) -> Value {
    if let (Some(a), Some(b)) = (current.as_i64().or(current.is_null().then_some(0)), update.as_i64()) {
        if let Some(total) = a.checked_add(b) {
            return Value::from(total);
        }
    }
    let total = current.as_f64().unwrap_or(0.0) + update.as_f64().unwrap_or(0.0);
    Value::from(total)
}

/// A state field: default factory, reducer, optional type check
#[derive(Clone)]
pub struct Annotation {
    default: DefaultFn,
    reducer: Reducer,
    field_type: Option<FieldType>,
}

impl fmt::Debug for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Annotation")
            .field("default", &(self.default)())
            .field("reducer", &self.reducer)
            .field("field_type", &self.field_type)
            .finish()
    }
}

impl Annotation {
    pub fn new<F>(default: F, reducer: Reducer) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            default: Arc::new(default),
            reducer,
            field_type: None,
        }
    }

    fn with_value(default: Value, reducer: Reducer) -> Self {
        Self::new(move || default.clone(), reducer)
    }

    pub fn replace(default: Value) -> Self {
        Self::with_value(default, Reducer::Replace)
    }

    pub fn append() -> Self {
        Self::with_value(Value::Array(vec![]), Reducer::Append).typed(FieldType::Array)
    }

    pub fn merge() -> Self {
        Self::with_value(Value::Object(Map::new()), Reducer::Merge).typed(FieldType::Object)
    }

    pub fn merge_by_id(key: impl Into<String>) -> Self {
        Self::with_value(Value::Array(vec![]), Reducer::MergeById(key.into()))
            .typed(FieldType::Array)
    }

    pub fn sum(default: impl Into<Value>) -> Self {
        Self::with_value(default.into(), Reducer::Sum).typed(FieldType::Number)
    }

    pub fn max(default: impl Into<Value>) -> Self {
        Self::with_value(default.into(), Reducer::Max).typed(FieldType::Number)
    }

    pub fn min(default: impl Into<Value>) -> Self {
        Self::with_value(default.into(), Reducer::Min).typed(FieldType::Number)
    }

    pub fn or() -> Self {
        Self::with_value(Value::Bool(false), Reducer::Or).typed(FieldType::Boolean)
    }

    pub fn and() -> Self {
        Self::with_value(Value::Bool(true), Reducer::And).typed(FieldType::Boolean)
    }

    pub fn if_defined(default: Value) -> Self {
        Self::with_value(default, Reducer::IfDefined)
    }

    pub fn custom<F>(default: Value, merge: F) -> Self
    where
        F: Fn(&Value, Value) -> Value + Send + Sync + 'static,
    {
        Self::with_value(default, Reducer::Custom(Arc::new(merge)))
    }

    /// Restrict accepted updates to one JSON type
    pub fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    pub fn default_value(&self) -> Value {
        (self.default)()
    }

    pub fn reducer(&self) -> &Reducer {
        &self.reducer
    }

    pub fn field_type(&self) -> Option<FieldType> {
        self.field_type
    }

    pub fn accepts(&self, value: &Value) -> bool {
        self.field_type.map_or(true, |t| t.accepts(value))
    }

    pub fn reduce(&self, current: &Value, update: Value) -> Value {
        self.reducer.merge(current, update)
    }
}

/// Full state schema: field name to annotation
#[derive(Debug, Clone, Default)]
pub struct AnnotationRoot {
    fields: BTreeMap<String, Annotation>,
}

impl AnnotationRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a field
    pub fn field(mut self, name: impl Into<String>, annotation: Annotation) -> Self {
        self.fields.insert(name.into(), annotation);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Annotation> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Fresh state seeded with every default
    pub fn initial_state(&self) -> GraphState {
        GraphState::from_schema(self)
    }

    /// Default value of every field
    pub fn defaults(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(name, annotation)| (name.clone(), annotation.default_value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold(reducer: &Reducer, default: Value, updates: Vec<Value>) -> Value {
        updates
            .into_iter()
            .fold(default, |acc, u| reducer.merge(&acc, u))
    }

    #[test]
    fn test_sequential_updates_fold_through_reducer() {
        let ann = Annotation::sum(0);
        let a = ann.reduce(&ann.default_value(), json!(2));
        let b = ann.reduce(&a, json!(5));
        assert_eq!(b, json!(7));
    }

    #[test]
    fn test_append_preserves_order() {
        let result = fold(
            &Reducer::Append,
            json!([]),
            vec![json!("a"), json!(["b", "c"]), json!("d")],
        );
        assert_eq!(result, json!(["a", "b", "c", "d"]));
    }

    #[test]
    fn test_merge_by_id_replaces_in_place() {
        let reducer = Reducer::MergeById("id".to_string());
        let result = fold(
            &reducer,
            json!([]),
            vec![
                json!([{"id": 1, "status": "pending"}, {"id": 2, "status": "pending"}]),
                json!({"id": 1, "status": "done"}),
                json!({"id": 3, "status": "pending"}),
            ],
        );
        assert_eq!(
            result,
            json!([
                {"id": 1, "status": "done"},
                {"id": 2, "status": "pending"},
                {"id": 3, "status": "pending"}
            ])
        );
    }

    #[test]
    fn test_max_min() {
        assert_eq!(
            fold(&Reducer::Max, json!(null), vec![json!(5), json!(3), json!(8)]),
            json!(8)
        );
        assert_eq!(
            fold(&Reducer::Min, json!(null), vec![json!(10), json!(15), json!(5)]),
            json!(5)
        );
    }

    #[test]
    fn test_sum_keeps_integers() {
        assert_eq!(fold(&Reducer::Sum, json!(0), vec![json!(1), json!(1), json!(1)]), json!(3));
        assert_eq!(fold(&Reducer::Sum, json!(0), vec![json!(1.5), json!(1)]), json!(2.5));
    }

    #[test]
    fn test_or_and() {
        assert_eq!(fold(&Reducer::Or, json!(false), vec![json!(false), json!(true), json!(false)]), json!(true));
        assert_eq!(fold(&Reducer::And, json!(true), vec![json!(true), json!(false), json!(true)]), json!(false));
    }

    #[test]
    fn test_if_defined_ignores_null() {
        assert_eq!(Reducer::IfDefined.merge(&json!("keep"), json!(null)), json!("keep"));
        assert_eq!(Reducer::IfDefined.merge(&json!("keep"), json!("new")), json!("new"));
    }

    #[test]
    fn test_merge_objects() {
        let result = fold(&Reducer::Merge, json!({}), vec![json!({"a": 1}), json!({"b": 2}), json!({"a": 10})]);
        assert_eq!(result, json!({"a": 10, "b": 2}));
    }

    #[test]
    fn test_custom_reducer() {
        let ann = Annotation::custom(json!(""), |cur, upd| {
            json!(format!("{}{}", cur.as_str().unwrap_or(""), upd.as_str().unwrap_or("")))
        });
        let v = ann.reduce(&ann.default_value(), json!("ab"));
        assert_eq!(ann.reduce(&v, json!("c")), json!("abc"));
    }

    #[test]
    fn test_field_type_accepts() {
        let ann = Annotation::sum(0);
        assert!(ann.accepts(&json!(1)));
        assert!(!ann.accepts(&json!("one")));
        assert!(ann.accepts(&json!(null)));
        assert!(Annotation::replace(json!(null)).accepts(&json!({"any": "thing"})));
    }

    #[test]
    fn test_root_defaults_are_fresh() {
        let root = AnnotationRoot::new()
            .field("items", Annotation::append())
            .field("count", Annotation::sum(0));
        let mut first = root.defaults();
        first.insert("count".into(), json!(99));
        assert_eq!(root.defaults()["count"], json!(0));
        assert_eq!(root.defaults()["items"], json!([]));
    }
}
