//! Association shape validation, reference checks and normalization.
//!
//! Everything here works on raw JSON so that a single pass can report every
//! violated field, including ones a typed decode would stop at.

use std::collections::HashSet;

use serde_json::{json, Map, Value};

use crate::error::{ErrorCode, ValidationErrors};
use crate::ids;
use crate::modules::{field, rounded_int};
use crate::types::{ExternalCategory, Operator, ResponseKind, Trigger};

pub const DEFAULT_THRESHOLD: i64 = 50;
pub const DEFAULT_STRENGTH: i64 = 50;
pub const DEFAULT_MAX_CONDITIONS: usize = 10;

/// The memory and emotion ids references are checked against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownIds {
    pub memories: HashSet<String>,
    pub emotions: HashSet<String>,
}

impl KnownIds {
    pub fn new<M, E>(memories: M, emotions: E) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            memories: memories.into_iter().map(Into::into).collect(),
            emotions: emotions.into_iter().map(Into::into).collect(),
        }
    }

    /// Memory ids from a `memories` array and emotion keys from an `emotions` map.
    pub fn from_collections(memories: Option<&Value>, emotions: Option<&Value>) -> Self {
        let memory_ids = memories
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|m| m.get("id").and_then(Value::as_str))
            .map(String::from);
        let emotion_ids = emotions
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|map| map.keys().cloned());
        Self::new(memory_ids, emotion_ids)
    }
}

/// Limits and policy for one validation pass.
#[derive(Debug, Clone, Copy)]
pub struct Rules<'a> {
    pub max_conditions: usize,
    /// `None` skips reference checks.
    pub known: Option<&'a KnownIds>,
}

// ── Normalization ──

/// Fill variant defaults, trim external items and round numeric fields.
/// Values of the wrong type are left alone for validation to report.
pub fn normalize_association(record: &mut Map<String, Value>) {
    if let Some(Value::Object(trigger)) = record.get_mut("trigger") {
        normalize_trigger(trigger);
    }
    if let Some(Value::Object(response)) = record.get_mut("response") {
        normalize_percent(response, "association_strength", DEFAULT_STRENGTH);
    }
}

pub fn normalize_trigger(trigger: &mut Map<String, Value>) {
    let kind = trigger.get("type").and_then(Value::as_str).map(String::from);
    match kind.as_deref() {
        Some("complex") => {
            trigger.entry("operator").or_insert_with(|| json!(Operator::And.as_str()));
            if let Some(Value::Array(conditions)) = trigger.get_mut("conditions") {
                for condition in conditions.iter_mut() {
                    if let Value::Object(c) = condition {
                        normalize_trigger(c);
                    }
                }
            }
        }
        Some("emotion") => normalize_percent(trigger, "threshold", DEFAULT_THRESHOLD),
        Some("external") => {
            trigger
                .entry("category")
                .or_insert_with(|| json!(ExternalCategory::Topics.as_str()));
            if let Some(Value::Array(items)) = trigger.get_mut("items") {
                if items.iter().all(Value::is_string) {
                    *items = clean_items(items.iter().filter_map(Value::as_str))
                        .into_iter()
                        .map(Value::String)
                        .collect();
                }
            }
        }
        _ => {}
    }
}

fn normalize_percent(map: &mut Map<String, Value>, key: &str, default: i64) {
    let value = match map.get(key) {
        None | Some(Value::Null) => Some(default),
        Some(v) => rounded_int(v),
    };
    if let Some(value) = value {
        map.insert(key.to_string(), json!(value));
    }
}

/// Trimmed, non-empty items in order.
pub fn clean_items<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    items
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ── Validation ──

/// Every violation in one association record. `prefix` labels fields
/// (`""` for the incremental API, `associations[3]` for documents).
pub fn validate_association(record: &Map<String, Value>, prefix: &str, rules: Rules<'_>) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    match record.get("id") {
        Some(Value::String(id)) if ids::is_valid_id(id) => {}
        None | Some(Value::Null) => errors.push(
            field(prefix, "id"),
            ErrorCode::MissingId,
            "Association id is required",
        ),
        Some(other) => errors.push(
            field(prefix, "id"),
            ErrorCode::InvalidIdFormat,
            format!("Invalid ID format: {}", plain(other)),
        ),
    }

    let trigger_field = field(prefix, "trigger");
    match record.get("trigger") {
        None | Some(Value::Null) => errors.push(
            trigger_field,
            ErrorCode::MissingTrigger,
            "Trigger is required",
        ),
        Some(Value::Object(trigger)) => validate_trigger(trigger, &trigger_field, rules, &mut errors),
        Some(_) => errors.push(trigger_field, ErrorCode::InvalidShape, "Trigger must be an object"),
    }

    let response_field = field(prefix, "response");
    match record.get("response") {
        None | Some(Value::Null) => errors.push(
            response_field,
            ErrorCode::MissingResponse,
            "Response is required",
        ),
        Some(Value::Object(response)) => {
            validate_response(response, &response_field, rules, &mut errors)
        }
        Some(_) => errors.push(response_field, ErrorCode::InvalidShape, "Response must be an object"),
    }

    errors
}

fn validate_trigger(trigger: &Map<String, Value>, at: &str, rules: Rules<'_>, errors: &mut ValidationErrors) {
    match trigger.get("type").and_then(Value::as_str) {
        Some("complex") => validate_complex(trigger, at, rules, errors),
        Some(kind @ ("memory" | "emotion" | "external")) => {
            validate_simple(kind, trigger, at, rules, errors)
        }
        other => errors.push(
            field(at, "type"),
            ErrorCode::UnsupportedTriggerType,
            format!(
                "Unsupported trigger type: {} (expected one of {})",
                other.unwrap_or("<missing>"),
                Trigger::TYPE_NAMES.join(", ")
            ),
        ),
    }
}

fn validate_complex(trigger: &Map<String, Value>, at: &str, rules: Rules<'_>, errors: &mut ValidationErrors) {
    match trigger.get("operator").and_then(Value::as_str).map(Operator::parse) {
        Some(Some(_)) => {}
        _ => errors.push(
            field(at, "operator"),
            ErrorCode::UnsupportedOperator,
            "Operator must be AND or OR",
        ),
    }

    let conditions_field = field(at, "conditions");
    let Some(conditions) = trigger.get("conditions").and_then(Value::as_array) else {
        errors.push(
            conditions_field,
            ErrorCode::EmptyConditions,
            "Complex trigger needs at least one condition",
        );
        return;
    };
    if conditions.is_empty() {
        errors.push(
            conditions_field.clone(),
            ErrorCode::EmptyConditions,
            "Complex trigger needs at least one condition",
        );
    }
    if conditions.len() > rules.max_conditions {
        errors.push(
            conditions_field.clone(),
            ErrorCode::MaxConditionsReached,
            format!(
                "Too many conditions: {} (max {})",
                conditions.len(),
                rules.max_conditions
            ),
        );
    }

    for (i, condition) in conditions.iter().enumerate() {
        let at = format!("{conditions_field}[{i}]");
        let Some(condition) = condition.as_object() else {
            errors.push(at, ErrorCode::InvalidShape, "Condition must be an object");
            continue;
        };
        match condition.get("type").and_then(Value::as_str) {
            Some("complex") => errors.push(
                field(&at, "type"),
                ErrorCode::NestedComplexCondition,
                "Conditions cannot contain complex triggers",
            ),
            Some(kind @ ("memory" | "emotion" | "external")) => {
                validate_simple(kind, condition, &at, rules, errors)
            }
            other => errors.push(
                field(&at, "type"),
                ErrorCode::UnsupportedTriggerType,
                format!("Unsupported condition type: {}", other.unwrap_or("<missing>")),
            ),
        }
    }
}

/// A `memory`, `emotion` or `external` trigger or condition.
fn validate_simple(
    kind: &str,
    shape: &Map<String, Value>,
    at: &str,
    rules: Rules<'_>,
    errors: &mut ValidationErrors,
) {
    match kind {
        "memory" => {
            if let Some(id) = required_id(shape, at, errors) {
                check_reference(ResponseKind::Memory, id, &field(at, "id"), rules, errors);
            }
        }
        "emotion" => {
            if let Some(id) = required_id(shape, at, errors) {
                check_reference(ResponseKind::Emotion, id, &field(at, "id"), rules, errors);
            }
            if !is_percent(shape.get("threshold")) {
                errors.push(
                    field(at, "threshold"),
                    ErrorCode::InvalidThreshold,
                    "Threshold must be an integer between 0 and 100",
                );
            }
        }
        _ => {
            let category = shape.get("category").and_then(Value::as_str);
            if category.and_then(ExternalCategory::parse).is_none() {
                errors.push(
                    field(at, "category"),
                    ErrorCode::UnsupportedCategory,
                    format!(
                        "Unsupported category: {} (expected topics, environment or keywords)",
                        category.unwrap_or("<missing>")
                    ),
                );
            }
            let non_empty = shape
                .get("items")
                .and_then(Value::as_array)
                .is_some_and(|items| {
                    items.iter().all(Value::is_string)
                        && items.iter().filter_map(Value::as_str).any(|s| !s.trim().is_empty())
                });
            if !non_empty {
                errors.push(
                    field(at, "items"),
                    ErrorCode::EmptyExternalItems,
                    "External trigger needs at least one non-empty item",
                );
            }
        }
    }
}

fn validate_response(response: &Map<String, Value>, at: &str, rules: Rules<'_>, errors: &mut ValidationErrors) {
    let kind = match response.get("type").and_then(Value::as_str) {
        Some("memory") => Some(ResponseKind::Memory),
        Some("emotion") => Some(ResponseKind::Emotion),
        other => {
            errors.push(
                field(at, "type"),
                ErrorCode::UnsupportedResponseType,
                format!(
                    "Unsupported response type: {} (expected one of {})",
                    other.unwrap_or("<missing>"),
                    ResponseKind::TYPE_NAMES.join(", ")
                ),
            );
            None
        }
    };
    if let Some(id) = required_id(response, at, errors) {
        if let Some(kind) = kind {
            check_reference(kind, id, &field(at, "id"), rules, errors);
        }
    }
    if !is_percent(response.get("association_strength")) {
        errors.push(
            field(at, "association_strength"),
            ErrorCode::InvalidAssociationStrength,
            "Association strength must be an integer between 0 and 100",
        );
    }
}

fn required_id<'a>(shape: &'a Map<String, Value>, at: &str, errors: &mut ValidationErrors) -> Option<&'a str> {
    match shape.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Some(id),
        _ => {
            errors.push(field(at, "id"), ErrorCode::MissingId, "Referenced id is required");
            None
        }
    }
}

fn check_reference(kind: ResponseKind, id: &str, at: &str, rules: Rules<'_>, errors: &mut ValidationErrors) {
    let Some(known) = rules.known else {
        return;
    };
    match kind {
        ResponseKind::Memory if !known.memories.contains(id) => errors.push(
            at,
            ErrorCode::UnknownMemoryReference,
            format!("Unknown memory: {id}"),
        ),
        ResponseKind::Emotion if !known.emotions.contains(id) => errors.push(
            at,
            ErrorCode::UnknownEmotionReference,
            format!("Unknown emotion: {id}"),
        ),
        _ => {}
    }
}

fn is_percent(value: Option<&Value>) -> bool {
    value
        .and_then(rounded_int)
        .is_some_and(|v| (0..=100).contains(&v))
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(known: Option<&KnownIds>) -> Rules<'_> {
        Rules {
            max_conditions: DEFAULT_MAX_CONDITIONS,
            known,
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_normalize_fills_variant_defaults() {
        let mut record = object(json!({
            "id": "a1",
            "trigger": {"type": "complex", "conditions": [
                {"type": "emotion", "id": "fear"},
                {"type": "external", "items": ["  rain ", "", "  "]}
            ]},
            "response": {"type": "emotion", "id": "joy", "association_strength": 70.4}
        }));
        normalize_association(&mut record);

        assert_eq!(record["trigger"]["operator"], "AND");
        assert_eq!(record["trigger"]["conditions"][0]["threshold"], 50);
        assert_eq!(record["trigger"]["conditions"][1]["category"], "topics");
        assert_eq!(record["trigger"]["conditions"][1]["items"], json!(["rain"]));
        assert_eq!(record["response"]["association_strength"], 70);
    }

    #[test]
    fn test_missing_trigger_and_response_reported_together() {
        let errors = validate_association(&object(json!({"id": "a1"})), "", rules(None));
        assert_eq!(
            errors.codes(),
            vec![ErrorCode::MissingTrigger, ErrorCode::MissingResponse]
        );
    }

    #[test]
    fn test_shape_errors() {
        let record = object(json!({
            "id": "a 1",
            "trigger": {"type": "smell"},
            "response": {"type": "ability", "id": "x", "association_strength": 150}
        }));
        let errors = validate_association(&record, "", rules(None));
        assert_eq!(
            errors.codes(),
            vec![
                ErrorCode::InvalidIdFormat,
                ErrorCode::UnsupportedTriggerType,
                ErrorCode::UnsupportedResponseType,
                ErrorCode::InvalidAssociationStrength,
            ]
        );
    }

    #[test]
    fn test_complex_rules() {
        let record = object(json!({
            "id": "a1",
            "trigger": {"type": "complex", "operator": "XOR", "conditions": [
                {"type": "complex", "conditions": []},
                {"type": "external", "category": "smells", "items": []}
            ]},
            "response": {"type": "emotion", "id": "joy", "association_strength": 50}
        }));
        let errors = validate_association(&record, "associations[0]", rules(None));
        assert_eq!(
            errors.codes(),
            vec![
                ErrorCode::UnsupportedOperator,
                ErrorCode::NestedComplexCondition,
                ErrorCode::UnsupportedCategory,
                ErrorCode::EmptyExternalItems,
            ]
        );
        assert_eq!(
            errors.errors[1].field,
            "associations[0].trigger.conditions[0].type"
        );
    }

    #[test]
    fn test_condition_limit() {
        let conditions: Vec<Value> = (0..3).map(|_| json!({"type": "memory", "id": "m1"})).collect();
        let record = object(json!({
            "id": "a1",
            "trigger": {"type": "complex", "operator": "OR", "conditions": conditions},
            "response": {"type": "memory", "id": "m1", "association_strength": 10}
        }));
        let tight = Rules {
            max_conditions: 2,
            known: None,
        };
        assert!(validate_association(&record, "", tight).has_code(ErrorCode::MaxConditionsReached));
        assert!(validate_association(&record, "", rules(None)).is_empty());
    }

    #[test]
    fn test_reference_checks_only_when_known_ids_given() {
        let record = object(json!({
            "id": "a1",
            "trigger": {"type": "complex", "operator": "AND", "conditions": [
                {"type": "memory", "id": "ghost"},
                {"type": "emotion", "id": "joy", "threshold": 10}
            ]},
            "response": {"type": "emotion", "id": "envy", "association_strength": 50}
        }));
        assert!(validate_association(&record, "", rules(None)).is_empty());

        let known = KnownIds::new(["m1"], ["joy"]);
        let errors = validate_association(&record, "", rules(Some(&known)));
        assert_eq!(
            errors.codes(),
            vec![
                ErrorCode::UnknownMemoryReference,
                ErrorCode::UnknownEmotionReference
            ]
        );
        assert!(errors.codes().iter().all(ErrorCode::is_integrity));
    }

    #[test]
    fn test_known_ids_from_collections() {
        let memories = json!([{"id": "m1"}, {"id": "m2"}, {"content": "no id"}]);
        let emotions = json!({"joy": {"baseline": 60}});
        let known = KnownIds::from_collections(Some(&memories), Some(&emotions));
        assert_eq!(known.memories.len(), 2);
        assert!(known.emotions.contains("joy"));
        assert_eq!(KnownIds::from_collections(None, None), KnownIds::default());
    }
}
