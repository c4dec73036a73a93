//! EmotionModule: the emotion map, its model, and the transient
//! `current_emotion_state` derived from baselines.

use std::collections::BTreeMap;
use std::rc::Rc;

use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{
    as_object, decode, field, read_map, rounded_int, shallow_merge, EntityModule, Keyed, Module,
    ModuleContext, ModuleSlot,
};
use crate::error::{ErrorCode, PersonaError, Result, ValidationErrors};
use crate::events::PersonaEvent;
use crate::ids;
use crate::store::paths;
use crate::types::{Emotion, EntityKind};

pub const MODULE_NAME: &str = "emotion";
pub const ID_PREFIX: &str = "emotion";
pub const MAX_DESCRIPTION_LENGTH: usize = 500;
pub const DEFAULT_BASELINE: i64 = 50;
/// Spread of `sync_state_from_baseline` around each baseline.
pub const STATE_VARIANCE: i64 = 20;

pub const EKMAN_EMOTIONS: [&str; 6] = ["joy", "sadness", "anger", "fear", "disgust", "surprise"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmotionModel {
    Ekman,
    Plutchik,
    Pad,
    Custom,
}

impl EmotionModel {
    pub const ALL: [EmotionModel; 4] = [
        EmotionModel::Ekman,
        EmotionModel::Plutchik,
        EmotionModel::Pad,
        EmotionModel::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionModel::Ekman => "Ekman",
            EmotionModel::Plutchik => "Plutchik",
            EmotionModel::Pad => "PAD",
            EmotionModel::Custom => "Custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }

    /// Starting emotion set. Only Ekman has its own; the others reuse it.
    pub fn default_emotions(&self) -> Map<String, Value> {
        if *self != EmotionModel::Ekman {
            info!("{} model has no emotion set of its own, using Ekman", self.as_str());
        }
        ekman_emotions()
    }
}

pub fn ekman_emotions() -> Map<String, Value> {
    let entries = [
        ("joy", 60, "Joy, happiness and a sense of accomplishment."),
        ("sadness", 30, "Sadness, loss and disappointment."),
        ("anger", 25, "Anger, frustration and resentment."),
        ("fear", 40, "Fear, anxiety and worry."),
        ("disgust", 20, "Disgust and rejection."),
        ("surprise", 50, "Surprise and reactions to the unexpected."),
    ];
    entries
        .into_iter()
        .map(|(id, baseline, description)| {
            (
                id.to_string(),
                json!({ "baseline": baseline, "description": description }),
            )
        })
        .collect()
}

/// Field checks for one emotion entry.
pub fn validate_emotion(record: &Map<String, Value>, prefix: &str) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    match record.get("baseline").map(|v| (v, rounded_int(v))) {
        Some((_, Some(b))) if (0..=100).contains(&b) => {}
        Some((v, _)) => errors.push(
            field(prefix, "baseline"),
            ErrorCode::InvalidBaseline,
            format!("Baseline must be an integer between 0 and 100, got {v}"),
        ),
        None => errors.push(
            field(prefix, "baseline"),
            ErrorCode::InvalidBaseline,
            "Baseline is required",
        ),
    }

    check_description(record, prefix, &mut errors);
    errors
}

pub(crate) fn check_description(record: &Map<String, Value>, prefix: &str, errors: &mut ValidationErrors) {
    match record.get("description") {
        None | Some(Value::Null) => {}
        Some(Value::String(d)) if d.chars().count() <= MAX_DESCRIPTION_LENGTH => {}
        Some(Value::String(_)) => errors.push(
            field(prefix, "description"),
            ErrorCode::DescriptionTooLong,
            format!("Description too long: max {MAX_DESCRIPTION_LENGTH} characters"),
        ),
        Some(_) => errors.push(
            field(prefix, "description"),
            ErrorCode::InvalidShape,
            "Description must be a string",
        ),
    }
}

fn clamp_percent(value: f64) -> i64 {
    (value.round() as i64).clamp(0, 100)
}

struct EmotionInner {
    slot: ModuleSlot,
}

#[derive(Clone)]
pub struct EmotionModule {
    inner: Rc<EmotionInner>,
}

impl Default for EmotionModule {
    fn default() -> Self {
        Self::new()
    }
}

impl EmotionModule {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(EmotionInner {
                slot: ModuleSlot::default(),
            }),
        }
    }

    fn emotions(&self) -> Result<Map<String, Value>> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        Ok(read_map(&attachment.store, paths::EMOTIONS))
    }

    fn emit(&self, event: PersonaEvent) -> Result<()> {
        self.inner.slot.get(MODULE_NAME)?.emit(event);
        Ok(())
    }

    fn store_emotions(&self, emotions: Map<String, Value>) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        attachment.store.set(paths::EMOTIONS, Value::Object(emotions));
        Ok(())
    }

    fn store_state(&self, state: Map<String, Value>) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        attachment
            .store
            .set(paths::CURRENT_EMOTION_STATE, Value::Object(state));
        Ok(())
    }

    fn state_map(&self) -> Result<Map<String, Value>> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        Ok(read_map(&attachment.store, paths::CURRENT_EMOTION_STATE))
    }

    fn baselines(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .emotions()?
            .iter()
            .map(|(id, e)| {
                let baseline = e.get("baseline").and_then(rounded_int).unwrap_or(DEFAULT_BASELINE);
                (id.clone(), baseline)
            })
            .collect())
    }

    // ── Model ──

    pub fn model(&self) -> Result<EmotionModel> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        Ok(attachment
            .store
            .get(paths::EMOTION_MODEL)
            .and_then(|v| v.as_str().and_then(EmotionModel::parse))
            .unwrap_or(EmotionModel::Ekman))
    }

    /// Replace the emotion set with `model`'s. Emotions that disappear go
    /// through [`delete`](EntityModule::delete) so their associations cascade.
    pub fn switch_model(&self, model: &str) -> Result<EmotionModel> {
        let model = EmotionModel::parse(model).ok_or_else(|| {
            PersonaError::invalid(
                "model",
                ErrorCode::UnsupportedModel,
                format!("Unsupported emotion model: {model}"),
            )
        })?;
        let next = model.default_emotions();

        for id in self.emotions()?.keys().cloned().collect::<Vec<_>>() {
            if !next.contains_key(&id) {
                self.delete(&id)?;
            }
        }

        let attachment = self.inner.slot.get(MODULE_NAME)?;
        attachment
            .store
            .set(paths::EMOTION_MODEL, Value::String(model.as_str().into()));
        self.store_emotions(next)?;
        self.reset_to_baseline(None)?;
        info!(model = model.as_str(), "Emotion model switched");
        self.emit(PersonaEvent::EmotionModelChanged {
            model: model.as_str().into(),
        })?;
        Ok(model)
    }

    // ── Baselines and current state ──

    /// Set a baseline, clamped to 0..=100. Returns the stored value.
    pub fn set_baseline(&self, id: &str, value: f64) -> Result<i64> {
        let mut emotions = self.emotions()?;
        let entry = emotions
            .get_mut(id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Emotion, id))?;
        let clamped = clamp_percent(value);
        entry.insert("baseline".into(), json!(clamped));
        self.store_emotions(emotions)?;
        self.emit(PersonaEvent::BaselineChanged {
            id: id.to_string(),
            value: clamped,
        })?;
        Ok(clamped)
    }

    pub fn current_state(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .state_map()?
            .iter()
            .filter_map(|(id, v)| rounded_int(v).map(|v| (id.clone(), v)))
            .collect())
    }

    /// Set one transient value, clamped to 0..=100. The emotion must exist.
    pub fn update_current_state(&self, id: &str, value: f64) -> Result<i64> {
        if !self.emotions()?.contains_key(id) {
            return Err(PersonaError::not_found(EntityKind::Emotion, id));
        }
        let clamped = clamp_percent(value);
        let mut state = self.state_map()?;
        state.insert(id.to_string(), json!(clamped));
        self.store_state(state)?;
        self.emit(PersonaEvent::EmotionStateChanged {
            id: id.to_string(),
            value: clamped,
        })?;
        Ok(clamped)
    }

    /// Draw every current value from `baseline ± 20`, clamped.
    pub fn sync_state_from_baseline(&self) -> Result<BTreeMap<String, i64>> {
        self.sync_state_with(&mut rand::thread_rng())
    }

    pub fn sync_state_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<BTreeMap<String, i64>> {
        let state: BTreeMap<String, i64> = self
            .baselines()?
            .into_iter()
            .map(|(id, baseline)| {
                let min = (baseline - STATE_VARIANCE).max(0);
                let max = (baseline + STATE_VARIANCE).min(100);
                (id, rng.gen_range(min..=max))
            })
            .collect();
        self.store_state(state.iter().map(|(k, v)| (k.clone(), json!(v))).collect())?;
        self.emit(PersonaEvent::EmotionStateSynced)?;
        Ok(state)
    }

    /// Reset one emotion (or all, with `None`) to its baseline.
    pub fn reset_to_baseline(&self, id: Option<&str>) -> Result<()> {
        let baselines = self.baselines()?;
        match id {
            Some(id) => {
                let baseline = *baselines
                    .get(id)
                    .ok_or_else(|| PersonaError::not_found(EntityKind::Emotion, id))?;
                self.update_current_state(id, baseline as f64)?;
            }
            None => {
                self.store_state(baselines.iter().map(|(k, v)| (k.clone(), json!(v))).collect())?;
                self.emit(PersonaEvent::EmotionStateSynced)?;
            }
        }
        Ok(())
    }

    /// `update(old_id, {"id": new_id})`.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<Keyed<Emotion>> {
        self.update(old_id, &json!({ "id": new_id }))
    }

    fn ensure_system(&self) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        let store = &attachment.store;
        if !matches!(store.get(paths::EMOTION_MODEL), Some(Value::String(_))) {
            store.set(paths::EMOTION_MODEL, json!(EmotionModel::Ekman.as_str()));
        }
        match store.get(paths::EMOTION_MODEL).and_then(|v| v.as_str().map(String::from)) {
            Some(model) if EmotionModel::parse(&model).is_none() => {
                warn!("Unsupported emotion model '{}', using Ekman", model);
                store.set(paths::EMOTION_MODEL, json!(EmotionModel::Ekman.as_str()));
            }
            _ => {}
        }
        if !matches!(store.get(paths::EMOTIONS), Some(Value::Object(_))) {
            store.set(paths::EMOTIONS, Value::Object(ekman_emotions()));
        }
        if !matches!(store.get(paths::CURRENT_EMOTION_STATE), Some(Value::Object(_))) {
            self.reset_to_baseline(None)?;
        }
        Ok(())
    }
}

impl EntityModule for EmotionModule {
    type Record = Keyed<Emotion>;

    fn kind(&self) -> EntityKind {
        EntityKind::Emotion
    }

    fn create(&self, draft: &Value) -> Result<String> {
        let draft = as_object(draft, "emotion")?;
        let mut emotions = self.emotions()?;

        let mut record = draft.clone();
        let requested = record.remove("id");
        record.entry("baseline").or_insert_with(|| json!(DEFAULT_BASELINE));
        record.entry("description").or_insert_with(|| json!(""));

        let mut errors = validate_emotion(&record, "");
        let id = match requested {
            None | Some(Value::Null) => {
                ids::first_unused(ID_PREFIX, emotions.keys().map(String::as_str))
            }
            Some(Value::String(id)) => {
                if !ids::is_valid_id(&id) {
                    errors.push("id", ErrorCode::InvalidIdFormat, format!("Invalid ID format: {id}"));
                } else if emotions.contains_key(&id) {
                    errors.push("id", ErrorCode::DuplicateId, format!("Duplicate ID: {id}"));
                }
                id
            }
            Some(other) => {
                errors.push("id", ErrorCode::InvalidIdFormat, format!("Invalid ID format: {other}"));
                String::new()
            }
        };
        errors.into_result()?;

        if let Some(b) = record.get("baseline").and_then(rounded_int) {
            record.insert("baseline".into(), json!(b));
        }
        let emotion: Emotion = decode(Value::Object(record), "emotion")?;
        let baseline = emotion.baseline;
        emotions.insert(id.clone(), serde_json::to_value(&emotion)?);
        self.store_emotions(emotions)?;

        let mut state = self.state_map()?;
        state.insert(id.clone(), json!(baseline));
        self.store_state(state)?;

        info!(id = %id, baseline, "Emotion added");
        self.emit(PersonaEvent::EmotionAdded { id: id.clone() })?;
        Ok(id)
    }

    fn read(&self, id: &str) -> Result<Keyed<Emotion>> {
        let value = self
            .emotions()?
            .remove(id)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Emotion, id))?;
        Ok(Keyed {
            id: id.to_string(),
            value: decode(value, "emotion")?,
        })
    }

    fn update(&self, id: &str, patch: &Value) -> Result<Keyed<Emotion>> {
        let patch = as_object(patch, "patch")?;
        let mut emotions = self.emotions()?;
        let current = emotions
            .get(id)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Emotion, id))?;
        let current = as_object(current, "emotion")?;

        let mut merged = shallow_merge(current, patch);
        let requested_id = merged.remove("id");

        let mut errors = validate_emotion(&merged, "");
        let new_id = match requested_id {
            None | Some(Value::Null) => id.to_string(),
            Some(Value::String(new_id)) => new_id,
            Some(other) => {
                errors.push("id", ErrorCode::InvalidIdFormat, format!("Invalid ID format: {other}"));
                id.to_string()
            }
        };
        if new_id != id {
            if !ids::is_valid_id(&new_id) {
                errors.push("id", ErrorCode::InvalidIdFormat, format!("Invalid ID format: {new_id}"));
            } else if emotions.contains_key(&new_id) {
                errors.push("id", ErrorCode::DuplicateId, format!("Duplicate ID: {new_id}"));
            }
        }
        errors.into_result()?;

        if let Some(b) = merged.get("baseline").and_then(rounded_int) {
            merged.insert("baseline".into(), json!(b));
        }
        let emotion: Emotion = decode(Value::Object(merged), "emotion")?;
        emotions.remove(id);
        emotions.insert(new_id.clone(), serde_json::to_value(&emotion)?);
        self.store_emotions(emotions)?;

        if new_id != id {
            let mut state = self.state_map()?;
            if let Some(value) = state.remove(id) {
                state.insert(new_id.clone(), value);
                self.store_state(state)?;
            }
            info!("Emotion renamed: {} -> {}", id, new_id);
            self.emit(PersonaEvent::EmotionIdChanged {
                old_id: id.to_string(),
                new_id: new_id.clone(),
            })?;
        }
        self.emit(PersonaEvent::EmotionUpdated { id: new_id.clone() })?;
        Ok(Keyed {
            id: new_id,
            value: emotion,
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        if !self.emotions()?.contains_key(id) {
            return Err(PersonaError::not_found(EntityKind::Emotion, id));
        }
        self.emit(PersonaEvent::EmotionBeforeRemove { id: id.to_string() })?;

        let mut emotions = self.emotions()?;
        emotions.remove(id);
        self.store_emotions(emotions)?;
        let mut state = self.state_map()?;
        if state.remove(id).is_some() {
            self.store_state(state)?;
        }
        info!(id, "Emotion removed");
        self.emit(PersonaEvent::EmotionRemoved { id: id.to_string() })?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Keyed<Emotion>>> {
        Ok(self
            .emotions()?
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value::<Emotion>(value) {
                Ok(value) => Some(Keyed { id, value }),
                Err(e) => {
                    warn!("Skipping malformed emotion '{}': {}", id, e);
                    None
                }
            })
            .collect())
    }

    fn exists(&self, id: &str) -> bool {
        self.emotions().is_ok_and(|e| e.contains_key(id))
    }
}

impl Module for EmotionModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn initialize(&self, ctx: &ModuleContext) -> Result<()> {
        self.inner.slot.attach(ctx);
        self.ensure_system()?;

        let weak = Rc::downgrade(&self.inner);
        self.inner.slot.listen(&ctx.bus, "persona:loaded", move |_| {
            if let Some(inner) = weak.upgrade() {
                EmotionModule { inner }.ensure_system()?;
            }
            Ok(())
        });
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.inner.slot.detach();
        Ok(())
    }
}
