//! End-to-end integrity checks through the public editor API.

use std::collections::HashSet;

use persona_core::document::{self, Format};
use persona_core::store::paths;
use persona_core::types::{Association, Condition, EntityKind, Trigger};
use persona_core::{EditorConfig, EntityModule, ErrorCode, PersonaEditor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

fn editor_with(config: EditorConfig) -> PersonaEditor {
    PersonaEditor::new(EditorConfig {
        persistence: false,
        autosave: false,
        ..config
    })
    .unwrap()
}

fn editor() -> PersonaEditor {
    editor_with(EditorConfig::default())
}

fn memory(id: &str) -> Value {
    json!({"id": id, "type": "episodic", "content": format!("memory {id}")})
}

fn memory_to_joy(memory: &str) -> Value {
    json!({
        "trigger": {"type": "memory", "id": memory},
        "response": {"type": "emotion", "id": "joy", "association_strength": 50}
    })
}

fn all_references(associations: &[Association]) -> Vec<(EntityKind, String)> {
    associations
        .iter()
        .flat_map(|a| a.references().into_iter().map(|(k, id)| (k, id.to_string())))
        .collect()
}

#[test]
fn rename_then_delete_follows_the_memory() {
    let editor = editor();
    editor.memories().create(&memory("m1")).unwrap();
    let a1 = editor.associations().add_association(&memory_to_joy("m1")).unwrap();

    editor.memories().rename("m1", "m2").unwrap();
    let renamed = editor.associations().get_association(&a1).unwrap();
    assert_eq!(renamed.trigger, Trigger::Memory { id: "m2".into() });

    editor.memories().delete("m2").unwrap();
    assert!(editor.associations().list().unwrap().is_empty());
}

#[test]
fn eleventh_condition_is_rejected() {
    let editor = editor();
    let conditions: Vec<Value> = (0..10)
        .map(|i| json!({"type": "emotion", "id": "sadness", "threshold": 10 + i}))
        .collect();
    let id = editor
        .associations()
        .add_association(&json!({
            "trigger": {"type": "complex", "operator": "AND", "conditions": conditions},
            "response": {"type": "emotion", "id": "fear", "association_strength": 30}
        }))
        .unwrap();
    let before = editor.store().get(paths::ASSOCIATIONS);

    let err = editor
        .associations()
        .add_complex_condition(&id, &json!({"type": "emotion", "id": "anger", "threshold": 70}))
        .unwrap_err();
    assert!(err.validation().unwrap().has_code(ErrorCode::MaxConditionsReached));
    assert_eq!(editor.store().get(paths::ASSOCIATIONS), before);
}

#[test]
fn dangling_reference_is_caught_by_one_layer_or_the_other() {
    // Enforced on add.
    let strict = editor();
    let err = strict
        .associations()
        .add_association(&memory_to_joy("nonexistent"))
        .unwrap_err();
    assert!(err.validation().unwrap().has_code(ErrorCode::UnknownMemoryReference));
    assert!(strict.associations().list().unwrap().is_empty());

    // Deferred on add, still refused at export.
    let lenient = editor_with(EditorConfig {
        enforce_association_references: false,
        ..EditorConfig::default()
    });
    lenient
        .associations()
        .add_association(&memory_to_joy("nonexistent"))
        .unwrap();
    assert!(lenient.validate().has_code(ErrorCode::UnknownMemoryReference));
    let err = lenient.export_document().unwrap_err();
    assert!(err.validation().unwrap().has_code(ErrorCode::UnknownMemoryReference));
}

#[test]
fn rename_reaches_complex_conditions_and_responses() {
    let editor = editor();
    editor.memories().create(&memory("m1")).unwrap();
    editor.memories().create(&memory("m2")).unwrap();
    editor
        .associations()
        .add_association(&json!({
            "trigger": {"type": "complex", "operator": "OR", "conditions": [
                {"type": "memory", "id": "m1"},
                {"type": "emotion", "id": "joy", "threshold": 20}
            ]},
            "response": {"type": "memory", "id": "m1", "association_strength": 70}
        }))
        .unwrap();
    editor
        .associations()
        .add_association(&json!({
            "trigger": {"type": "memory", "id": "m2"},
            "response": {"type": "memory", "id": "m1", "association_strength": 20}
        }))
        .unwrap();

    editor.memories().rename("m1", "first_day").unwrap();
    let refs = all_references(&editor.associations().list().unwrap());
    assert!(!refs.iter().any(|(_, id)| id == "m1"));
    assert_eq!(refs.iter().filter(|(_, id)| id == "first_day").count(), 3);

    editor.emotions().rename("joy", "delight").unwrap();
    let complex = editor.associations().get_association("assoc_1").unwrap();
    assert_eq!(
        complex.trigger.conditions()[1],
        Condition::Emotion {
            id: "delight".into(),
            threshold: 20
        }
    );
}

#[test]
fn random_mutations_keep_ids_unique_and_references_live() {
    let editor = editor();
    let mut rng = StdRng::seed_from_u64(7);

    for step in 0..300 {
        let memories: Vec<String> = editor.memories().list().unwrap().into_iter().map(|m| m.id).collect();
        let associations: Vec<String> = editor
            .associations()
            .list()
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        let pick = |rng: &mut StdRng, ids: &[String]| ids[rng.gen_range(0..ids.len())].clone();
        let before = editor.store().get(paths::PERSONA);

        let outcome = match rng.gen_range(0..6) {
            0 | 1 => editor
                .memories()
                .create(&json!({"type": "semantic", "content": format!("fact {step}")}))
                .map(|_| ()),
            2 if !memories.is_empty() => {
                let target = format!("m{}", rng.gen_range(0..8));
                editor.memories().rename(&pick(&mut rng, &memories), &target).map(|_| ())
            }
            3 if !memories.is_empty() => editor.memories().delete(&pick(&mut rng, &memories)),
            4 if !memories.is_empty() => {
                let trigger = pick(&mut rng, &memories);
                editor.associations().add_association(&memory_to_joy(&trigger)).map(|_| ())
            }
            5 if !associations.is_empty() => {
                let strength = rng.gen_range(-20..130);
                editor
                    .associations()
                    .update_association(
                        &pick(&mut rng, &associations),
                        &json!({"response": {"type": "emotion", "id": "fear", "association_strength": strength}}),
                    )
                    .map(|_| ())
            }
            _ => Ok(()),
        };
        if outcome.is_err() {
            assert_eq!(editor.store().get(paths::PERSONA), before, "step {step}");
        }

        let memories: Vec<String> = editor.memories().list().unwrap().into_iter().map(|m| m.id).collect();
        let unique: HashSet<&String> = memories.iter().collect();
        assert_eq!(unique.len(), memories.len(), "step {step}");

        let associations = editor.associations().list().unwrap();
        let unique: HashSet<&str> = associations.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(unique.len(), associations.len(), "step {step}");

        for (kind, id) in all_references(&associations) {
            if kind == EntityKind::Memory {
                assert!(memories.contains(&id), "step {step}: dangling {id}");
            }
        }
    }
}

#[test]
fn fixup_is_idempotent() {
    let editor = editor();
    let report = editor
        .load_document(json!({
            "memory_system": {"memories": [
                {"id": "dup", "type": "episodic", "content": "a"},
                {"id": "dup", "type": "episodic", "content": "b"},
                {"type": "semantic", "content": "no id"}
            ]}
        }))
        .unwrap();
    assert_eq!(report.fixed_ids, 2);
    let healed = editor.persona();

    assert_eq!(editor.memories().fix_ids().unwrap(), 0);
    assert_eq!(editor.associations().fix_ids().unwrap(), 0);
    assert_eq!(editor.persona(), healed);
}

#[test]
fn editor_documents_round_trip() {
    let editor = editor();
    editor.load_document(document::sample_persona()).unwrap();
    editor.memories().create(&memory("harbour")).unwrap();
    editor
        .associations()
        .add_association(&json!({
            "trigger": {"type": "external", "category": "environment", "items": ["rain", "fog"]},
            "response": {"type": "memory", "id": "harbour", "association_strength": 65}
        }))
        .unwrap();
    editor.emotions().set_baseline("sadness", 35.0).unwrap();
    let original = editor.persona();

    for format in [Format::Json, Format::Yaml] {
        let text = editor.export_string(format).unwrap();
        let report = editor.import_str(&text, format).unwrap();
        assert!(report.is_clean(), "{format:?}: {report:?}");
        assert_eq!(editor.persona(), original, "{format:?}");
    }
}

#[test]
fn deleted_entities_stay_deleted_across_round_trips() {
    let editor = editor();
    editor.load_document(document::sample_persona()).unwrap();
    editor.emotions().delete("disgust").unwrap();
    editor.cognitive().delete("working_memory").unwrap();
    editor.memories().delete("childhood_memory_1").unwrap();
    let original = editor.persona();
    assert!(original["current_emotion_state"].get("disgust").is_none());

    for format in [Format::Json, Format::Yaml] {
        let text = editor.export_string(format).unwrap();
        let report = editor.import_str(&text, format).unwrap();
        assert!(report.is_clean(), "{format:?}: {report:?}");
        assert_eq!(editor.persona(), original, "{format:?}");
        assert!(!editor.emotions().exists("disgust"));
        assert!(!editor.cognitive().exists("working_memory"));
        assert!(editor.memories().list().unwrap().is_empty());
    }
}

#[test]
fn free_text_blocks_come_back_verbatim() {
    let samples = [
        "tone: warm",
        "tone: warm\n",
        "42",
        "Speak slowly.\nAvoid slang.\n\nNever mention the weather.",
        "zeta: 1\nalpha: 2",
    ];
    let editor = editor();
    editor.load_document(document::sample_persona()).unwrap();

    for text in samples {
        editor
            .store()
            .set("persona.dialogue_instructions", json!(text));
        editor
            .store()
            .set("persona.disease_specific_prompts", json!(text));
        let original = editor.persona();

        for format in [Format::Json, Format::Yaml] {
            let exported = editor.export_string(format).unwrap();
            editor.import_str(&exported, format).unwrap();
            assert_eq!(editor.persona(), original, "{format:?} {text:?}");
            assert_eq!(editor.persona()["dialogue_instructions"], json!(text));
        }
    }
}
