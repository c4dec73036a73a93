//! Serialized persona documents: the default template, JSON/YAML I/O,
//! free-text blocks, whole-document validation and the import/export
//! transformations.
//!
//! The store holds the "editor form" of a persona, where the free-text
//! blocks are raw YAML text. Exported documents carry those blocks as
//! nested objects instead and are stamped with `export_info`.

use std::collections::HashSet;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::association::validate::{self as association_rules, KnownIds, Rules};
use crate::error::{ErrorCode, FieldError, IntegrityWarning, PersonaError, Result, ValidationErrors};
use crate::modules::cognitive::{validate_ability, wais_abilities, CognitiveModel};
use crate::modules::emotion::{ekman_emotions, validate_emotion, EmotionModel, DEFAULT_BASELINE};
use crate::modules::memory::validate_memory;
use crate::modules::rounded_int;

pub const VERSION: &str = "2025.2";
pub const EXPORTED_BY: &str = "persona-editor";

/// Free-text blocks stored as raw text and exported as objects.
pub const TEXT_BLOCKS: [&str; 3] = [
    "dialogue_instructions",
    "non_dialogue_metadata",
    "disease_specific_prompts",
];

/// Sections every exported document carries.
pub const REQUIRED_SECTIONS: [&str; 6] = [
    "personal_info",
    "personality",
    "emotion_system",
    "memory_system",
    "association_system",
    "cognitive_system",
];

pub const BIG_FIVE_MODEL: &str = "Big Five";
pub const BIG_FIVE_TRAITS: [&str; 5] = [
    "openness",
    "conscientiousness",
    "extraversion",
    "agreeableness",
    "neuroticism",
];

// ── Formats ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// By file extension; `None` for anything but `.json`, `.yaml` and `.yml`.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            _ => None,
        }
    }

    /// Guess from content: a leading `{` means JSON.
    pub fn detect(text: &str) -> Self {
        if text.trim_start().starts_with('{') {
            Format::Json
        } else {
            Format::Yaml
        }
    }
}

pub fn parse_document(text: &str, format: Format) -> Result<Value> {
    let value: Value = match format {
        Format::Json => serde_json::from_str(text)?,
        Format::Yaml => serde_yaml::from_str(text)?,
    };
    if !value.is_object() {
        return Err(PersonaError::Parse(
            "Persona document must be a mapping at the top level".into(),
        ));
    }
    Ok(value)
}

pub fn render_document(doc: &Value, format: Format) -> Result<String> {
    Ok(match format {
        Format::Json => serde_json::to_string_pretty(doc)?,
        Format::Yaml => serde_yaml::to_string(doc)?,
    })
}

// ── Templates ──

/// The canonical empty persona, in editor form.
pub fn default_persona() -> Value {
    let mut doc = json!({
        "version": VERSION,
        "personal_info": {
            "name": "",
            "age": null,
            "gender": "",
            "occupation": ""
        },
        "background": "",
        "personality": {
            "model": BIG_FIVE_MODEL,
            "traits": {
                "openness": 0.7,
                "conscientiousness": 0.6,
                "extraversion": 0.4,
                "agreeableness": 0.65,
                "neuroticism": 0.35
            }
        },
        "emotion_system": {
            "model": EmotionModel::Ekman.as_str(),
            "emotions": ekman_emotions()
        },
        "current_emotion_state": {},
        "memory_system": { "memories": [] },
        "association_system": { "associations": [] },
        "cognitive_system": {
            "model": CognitiveModel::WaisIv.as_str(),
            "abilities": wais_abilities()
        }
    });
    if let Value::Object(map) = &mut doc {
        for block in TEXT_BLOCKS {
            map.insert(block.into(), Value::String(String::new()));
        }
    }
    initialize_emotion_state(&mut doc);
    doc
}

/// A small complete persona: one memory linked to joy.
pub fn sample_persona() -> Value {
    let mut doc = default_persona();
    deep_merge(
        &mut doc,
        json!({
            "personal_info": {
                "name": "Sample Persona",
                "age": 28,
                "occupation": "Illustrator"
            },
            "background": "Grew up in a coastal town and moved to the city for art school.",
            "memory_system": {
                "memories": [{
                    "id": "childhood_memory_1",
                    "type": "episodic",
                    "content": "A family holiday at the seaside: touching the waves for the first time and collecting shells.",
                    "period": "childhood",
                    "emotional_valence": 0.8
                }]
            },
            "association_system": {
                "associations": [{
                    "id": "assoc_1",
                    "trigger": { "type": "memory", "id": "childhood_memory_1" },
                    "response": { "type": "emotion", "id": "joy", "association_strength": 85 }
                }]
            }
        }),
    );
    doc
}

/// Merge `overlay` into `base`: objects recursively, everything else replaced.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Fill `current_emotion_state` entries missing for a defined emotion from
/// its baseline. Existing entries are kept.
pub fn initialize_emotion_state(doc: &mut Value) {
    let baselines: Vec<(String, i64)> = doc
        .pointer("/emotion_system/emotions")
        .and_then(Value::as_object)
        .map(|emotions| {
            emotions
                .iter()
                .map(|(id, e)| {
                    let baseline = e
                        .get("baseline")
                        .and_then(rounded_int)
                        .unwrap_or(DEFAULT_BASELINE)
                        .clamp(0, 100);
                    (id.clone(), baseline)
                })
                .collect()
        })
        .unwrap_or_default();

    let Some(doc) = doc.as_object_mut() else { return };
    let state = doc
        .entry("current_emotion_state")
        .or_insert_with(|| json!({}));
    if !state.is_object() {
        *state = json!({});
    }
    if let Value::Object(state) = state {
        for (id, baseline) in baselines {
            state.entry(id).or_insert_with(|| json!(baseline));
        }
    }
}

// ── Free-text blocks ──

/// Parse a text block for export. Empty text is `{}`. The parsed value is
/// used only when [`block_to_text`] renders it back to exactly `text`;
/// anything else (invalid YAML, extra whitespace, reordered keys) is kept
/// as the raw string so that import restores it unchanged.
pub fn text_to_block(text: &str) -> Value {
    if text.is_empty() {
        return json!({});
    }
    let parsed = match serde_yaml::from_str::<Value>(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Text block kept verbatim: {}", e);
            return Value::String(text.to_string());
        }
    };
    match block_to_text(&parsed) {
        Ok(rendered) if rendered == text => parsed,
        _ => Value::String(text.to_string()),
    }
}

/// Render an imported block back to editor text. Structured blocks are
/// rendered as YAML without the final newline.
pub fn block_to_text(block: &Value) -> Result<String> {
    Ok(match block {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => {
            let mut text = serde_yaml::to_string(other)?;
            if text.ends_with('\n') {
                text.pop();
            }
            text
        }
    })
}

// ── Validation ──

/// Every problem in a persona document, labelled with its path. Used as
/// warnings on import and as a hard gate on export.
pub fn validate_persona(doc: &Value, max_conditions: usize) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    let Some(root) = doc.as_object() else {
        errors.push("", ErrorCode::InvalidShape, "Persona document must be an object");
        return errors;
    };

    for section in REQUIRED_SECTIONS {
        if !matches!(root.get(section), Some(Value::Object(_))) {
            errors.push(section, ErrorCode::MissingSection, format!("Missing section: {section}"));
        }
    }

    check_personal_info(root, &mut errors);
    check_personality(root, &mut errors);
    let emotion_ids = check_emotions(root, &mut errors);
    let memory_ids = check_memories(root, &mut errors);
    check_abilities(root, &mut errors);

    let known = KnownIds::new(memory_ids, emotion_ids);
    check_associations(root, &known, max_conditions, &mut errors);
    errors
}

/// The dangling-reference subset of [`validate_persona`].
pub fn integrity_warnings(doc: &Value, max_conditions: usize) -> Vec<IntegrityWarning> {
    validate_persona(doc, max_conditions)
        .errors
        .into_iter()
        .filter(|e| e.code.is_integrity())
        .collect()
}

fn check_personal_info(root: &Map<String, Value>, errors: &mut ValidationErrors) {
    let Some(age) = root.get("personal_info").and_then(|p| p.get("age")) else {
        return;
    };
    let valid = age.is_null() || age.as_f64().is_some_and(|a| (0.0..=150.0).contains(&a));
    if !valid {
        errors.push(
            "personal_info.age",
            ErrorCode::InvalidShape,
            "Age must be a number between 0 and 150",
        );
    }
}

fn check_personality(root: &Map<String, Value>, errors: &mut ValidationErrors) {
    let Some(personality) = root.get("personality").and_then(Value::as_object) else {
        return;
    };
    if personality.get("model").and_then(Value::as_str) != Some(BIG_FIVE_MODEL) {
        return;
    }
    let traits = personality.get("traits").and_then(Value::as_object);
    for name in BIG_FIVE_TRAITS {
        let label = format!("personality.traits.{name}");
        match traits.and_then(|t| t.get(name)) {
            None | Some(Value::Null) => {
                errors.push(label, ErrorCode::MissingTrait, format!("Missing trait: {name}"))
            }
            Some(v) if v.as_f64().is_some_and(|f| (0.0..=1.0).contains(&f)) => {}
            Some(_) => errors.push(
                label,
                ErrorCode::InvalidTrait,
                format!("Trait {name} must be between 0 and 1"),
            ),
        }
    }
}

fn check_emotions(root: &Map<String, Value>, errors: &mut ValidationErrors) -> Vec<String> {
    let emotions = root
        .get("emotion_system")
        .and_then(|s| s.get("emotions"))
        .and_then(Value::as_object);
    let Some(emotions) = emotions else {
        errors.push(
            "emotion_system.emotions",
            ErrorCode::MissingEmotion,
            "At least one emotion is required",
        );
        return Vec::new();
    };
    if emotions.is_empty() {
        errors.push(
            "emotion_system.emotions",
            ErrorCode::MissingEmotion,
            "At least one emotion is required",
        );
    }

    for (id, record) in emotions {
        let prefix = format!("emotion_system.emotions.{id}");
        match record.as_object() {
            Some(record) => errors.extend(validate_emotion(record, &prefix)),
            None => errors.push(prefix, ErrorCode::InvalidShape, "Emotion must be an object"),
        }
    }

    if let Some(state) = root.get("current_emotion_state").and_then(Value::as_object) {
        for (id, value) in state {
            let label = format!("current_emotion_state.{id}");
            if !emotions.contains_key(id) {
                errors.push(
                    label.clone(),
                    ErrorCode::UnknownEmotionReference,
                    format!("Emotion state refers to undefined emotion: {id}"),
                );
            }
            if !rounded_int(value).is_some_and(|v| (0..=100).contains(&v)) {
                errors.push(
                    label,
                    ErrorCode::InvalidBaseline,
                    "Emotion state must be between 0 and 100",
                );
            }
        }
    }
    emotions.keys().cloned().collect()
}

fn check_memories(root: &Map<String, Value>, errors: &mut ValidationErrors) -> Vec<String> {
    let memories = root
        .get("memory_system")
        .and_then(|s| s.get("memories"))
        .and_then(Value::as_array);
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for (i, record) in memories.into_iter().flatten().enumerate() {
        let prefix = format!("memory_system.memories[{i}]");
        let Some(record) = record.as_object() else {
            errors.push(prefix, ErrorCode::InvalidShape, "Memory must be an object");
            continue;
        };
        errors.extend(validate_memory(record, &prefix));
        match record.get("id").and_then(Value::as_str) {
            Some(id) => {
                if !seen.insert(id) {
                    errors.push(
                        format!("{prefix}.id"),
                        ErrorCode::DuplicateId,
                        format!("Duplicate memory ID: {id}"),
                    );
                }
                ids.push(id.to_string());
            }
            None => errors.push(format!("{prefix}.id"), ErrorCode::MissingId, "Memory id is required"),
        }
    }
    ids
}

fn check_abilities(root: &Map<String, Value>, errors: &mut ValidationErrors) {
    let abilities = root
        .get("cognitive_system")
        .and_then(|s| s.get("abilities"))
        .and_then(Value::as_object);
    match abilities {
        Some(abilities) if !abilities.is_empty() => {
            for (id, record) in abilities {
                let prefix = format!("cognitive_system.abilities.{id}");
                match record.as_object() {
                    Some(record) => errors.extend(validate_ability(record, &prefix)),
                    None => errors.push(prefix, ErrorCode::InvalidShape, "Ability must be an object"),
                }
            }
        }
        _ => errors.push(
            "cognitive_system.abilities",
            ErrorCode::MissingAbility,
            "At least one cognitive ability is required",
        ),
    }
}

fn check_associations(
    root: &Map<String, Value>,
    known: &KnownIds,
    max_conditions: usize,
    errors: &mut ValidationErrors,
) {
    let associations = root
        .get("association_system")
        .and_then(|s| s.get("associations"))
        .and_then(Value::as_array);
    let rules = Rules {
        max_conditions,
        known: Some(known),
    };
    let mut seen = HashSet::new();
    for (i, record) in associations.into_iter().flatten().enumerate() {
        let prefix = format!("association_system.associations[{i}]");
        let Some(record) = record.as_object() else {
            errors.push(prefix, ErrorCode::InvalidShape, "Association must be an object");
            continue;
        };
        let mut record = record.clone();
        association_rules::normalize_association(&mut record);
        errors.extend(association_rules::validate_association(&record, &prefix, rules));

        if let Some(id) = record.get("id").and_then(Value::as_str) {
            if !seen.insert(id.to_string()) {
                errors.push(
                    format!("{prefix}.id"),
                    ErrorCode::DuplicateId,
                    format!("Duplicate association ID: {id}"),
                );
            }
        }
    }
}

/// A warning when the document was written by a different editor version.
pub fn check_version(doc: &Value) -> Option<FieldError> {
    let version = doc.get("version").and_then(Value::as_str).unwrap_or("1.0.0");
    if version == VERSION {
        return None;
    }
    let mut message = format!("Document version {version} differs from editor version {VERSION}");
    if version < "2025.0" {
        message.push_str("; documents this old may not load completely");
    }
    Some(FieldError::new("version", ErrorCode::VersionMismatch, message))
}

// ── Import / export ──

/// Turn a parsed document into editor form: strip `export_info`, fill
/// missing sections from the template, normalize associations, render
/// text blocks and complete the emotion state.
///
/// Returns the persona and any version warning. Reference and id problems
/// are left for the caller to heal and report once the persona is loaded.
pub fn prepare_import(raw: Value) -> Result<(Value, Vec<IntegrityWarning>)> {
    let mut warnings = Vec::new();
    if let Some(warning) = check_version(&raw) {
        warn!("{}", warning);
        warnings.push(warning);
    }

    let Value::Object(mut map) = raw else {
        return Err(PersonaError::Parse(
            "Persona document must be a mapping at the top level".into(),
        ));
    };
    map.remove("export_info");
    fill_missing_sections(&mut map);

    map.insert("version".into(), json!(VERSION));
    for block in TEXT_BLOCKS {
        let text = match map.get(block) {
            Some(value) => block_to_text(value)?,
            None => String::new(),
        };
        map.insert(block.into(), Value::String(text));
    }
    if let Some(Value::Array(associations)) = map
        .get_mut("association_system")
        .and_then(|s| s.get_mut("associations"))
    {
        for record in associations.iter_mut() {
            if let Value::Object(record) = record {
                association_rules::normalize_association(record);
            }
        }
    }

    let mut doc = Value::Object(map);
    initialize_emotion_state(&mut doc);
    Ok((doc, warnings))
}

/// Add template sections the document lacks entirely. A section that is
/// present only gains its missing top-level fields; entity maps and lists
/// already in the document are never merged with template entries.
fn fill_missing_sections(doc: &mut Map<String, Value>) {
    let Value::Object(template) = default_persona() else { return };
    for (key, fallback) in template {
        if key == "current_emotion_state" {
            continue;
        }
        match (doc.get_mut(&key), fallback) {
            (None, fallback) => {
                doc.insert(key, fallback);
            }
            (Some(Value::Object(section)), Value::Object(fallback)) => {
                for (field, value) in fallback {
                    section.entry(field).or_insert(value);
                }
            }
            _ => {}
        }
    }
}

/// Produce the exported form of an editor-form persona. Fails with every
/// violation if the persona does not validate.
pub fn prepare_export(persona: &Value, max_conditions: usize) -> Result<Value> {
    validate_persona(persona, max_conditions).into_result()?;

    let mut doc = persona.clone();
    let Value::Object(map) = &mut doc else {
        return Err(PersonaError::Parse("Persona document must be an object".into()));
    };
    for block in TEXT_BLOCKS {
        let text = map.get(block).and_then(Value::as_str).unwrap_or_default();
        let parsed = text_to_block(text);
        map.insert(block.into(), parsed);
    }
    map.insert("version".into(), json!(VERSION));
    map.insert(
        "export_info".into(),
        json!({
            "exported_at": chrono::Utc::now().to_rfc3339(),
            "exported_by": EXPORTED_BY,
            "version": VERSION,
        }),
    );
    Ok(doc)
}
