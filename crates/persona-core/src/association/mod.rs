//! AssociationModule: owns `persona.association_system.associations` and
//! keeps every reference in it pointing at a live memory or emotion.
//!
//! All writes validate the whole record before committing. Renames and
//! removals of memories and emotions arrive as bus events and are applied
//! best-effort: a failing step is logged and the rest of the cascade runs.

pub mod analysis;
pub mod cascade;
pub mod fixup;
pub mod validate;

use std::cell::Cell;
use std::rc::Rc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::EditorConfig;
use crate::error::{ErrorCode, PersonaError, Result};
use crate::events::PersonaEvent;
use crate::ids;
use crate::modules::{
    as_object, decode, now, shallow_merge, Cascadable, EntityModule, Module, ModuleContext,
    ModuleSlot,
};
use crate::store::{paths, PathStore};
use crate::types::{Association, EntityKind, ResponseKind, Trigger};

pub use analysis::{AssociationStats, NetworkAnalysis, StrengthDistribution};
pub use validate::{KnownIds, Rules};

pub const MODULE_NAME: &str = "association";

const CASCADE_EVENTS: [&str; 5] = [
    "memory:id:changed",
    "memory:before:remove",
    "emotion:id:changed",
    "emotion:before:remove",
    "persona:loaded",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationSettings {
    pub max_conditions: usize,
    /// Check memory/emotion existence on add and update.
    pub enforce_references: bool,
}

impl Default for AssociationSettings {
    fn default() -> Self {
        Self {
            max_conditions: validate::DEFAULT_MAX_CONDITIONS,
            enforce_references: true,
        }
    }
}

impl From<&EditorConfig> for AssociationSettings {
    fn from(config: &EditorConfig) -> Self {
        Self {
            max_conditions: config.max_conditions,
            enforce_references: config.enforce_association_references,
        }
    }
}

/// Decodable associations in the store, in order. Malformed records are skipped.
pub(crate) fn stored_associations(store: &PathStore) -> Vec<Association> {
    match store.get(paths::ASSOCIATIONS) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<Association>(record) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("Skipping malformed association record: {}", e);
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

struct AssociationInner {
    slot: ModuleSlot,
    settings: Cell<AssociationSettings>,
}

#[derive(Clone)]
pub struct AssociationModule {
    inner: Rc<AssociationInner>,
}

impl Default for AssociationModule {
    fn default() -> Self {
        Self::new(AssociationSettings::default())
    }
}

impl AssociationModule {
    pub fn new(settings: AssociationSettings) -> Self {
        Self {
            inner: Rc::new(AssociationInner {
                slot: ModuleSlot::default(),
                settings: Cell::new(settings),
            }),
        }
    }

    pub fn settings(&self) -> AssociationSettings {
        self.inner.settings.get()
    }

    pub fn set_settings(&self, settings: AssociationSettings) {
        self.inner.settings.set(settings);
    }

    // ── Store access ──

    fn store(&self) -> Result<Rc<PathStore>> {
        Ok(self.inner.slot.get(MODULE_NAME)?.store)
    }

    fn raw(&self) -> Result<Vec<Value>> {
        Ok(match self.store()?.get(paths::ASSOCIATIONS) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        })
    }

    fn commit(&self, records: Vec<Value>) -> Result<()> {
        self.store()?.set(paths::ASSOCIATIONS, Value::Array(records));
        Ok(())
    }

    fn emit(&self, event: PersonaEvent) -> Result<()> {
        self.inner.slot.get(MODULE_NAME)?.emit(event);
        Ok(())
    }

    fn position(records: &[Value], id: &str) -> Result<usize> {
        records
            .iter()
            .position(|r| record_id(r) == Some(id))
            .ok_or_else(|| PersonaError::not_found(EntityKind::Association, id))
    }

    pub fn known_ids(&self) -> Result<KnownIds> {
        let store = self.store()?;
        Ok(KnownIds::from_collections(
            store.get(paths::MEMORIES).as_ref(),
            store.get(paths::EMOTIONS).as_ref(),
        ))
    }

    /// Normalize, validate against the current collection and decode. `skip`
    /// is the record's own index when updating.
    fn prepare(
        &self,
        mut record: Map<String, Value>,
        records: &[Value],
        skip: Option<usize>,
        check_references: bool,
    ) -> Result<Association> {
        validate::normalize_association(&mut record);

        let settings = self.settings();
        let known = if check_references {
            Some(self.known_ids()?)
        } else {
            None
        };
        let rules = Rules {
            max_conditions: settings.max_conditions,
            known: known.as_ref(),
        };
        let mut errors = validate::validate_association(&record, "", rules);

        if let Some(id) = record.get("id").and_then(Value::as_str) {
            let taken = records
                .iter()
                .enumerate()
                .any(|(i, r)| Some(i) != skip && record_id(r) == Some(id));
            if taken {
                errors.push("id", ErrorCode::DuplicateId, format!("Duplicate ID: {id}"));
            }
        }
        errors.into_result()?;
        decode(Value::Object(record), "association")
    }

    // ── CRUD ──

    pub fn add_association(&self, draft: &Value) -> Result<String> {
        let mut record = as_object(draft, "association")?.clone();
        let mut records = self.raw()?;

        if matches!(record.get("id"), None | Some(Value::Null)) {
            let id = ids::first_unused(fixup::ID_PREFIX, records.iter().filter_map(record_id));
            record.insert("id".into(), Value::String(id));
        }
        let stamp = now();
        record.insert("created_at".into(), Value::String(stamp.clone()));
        record.insert("updated_at".into(), Value::String(stamp));

        let association = self.prepare(record, &records, None, self.settings().enforce_references)?;
        records.push(serde_json::to_value(&association)?);
        self.commit(records)?;

        info!(
            id = %association.id,
            trigger = association.trigger.type_name(),
            "Association added"
        );
        self.emit(PersonaEvent::AssociationAdded {
            id: association.id.clone(),
        })?;
        Ok(association.id)
    }

    pub fn get_association(&self, id: &str) -> Result<Association> {
        let records = self.raw()?;
        let index = Self::position(&records, id)?;
        decode(records[index].clone(), "association")
    }

    pub fn update_association(&self, id: &str, patch: &Value) -> Result<Association> {
        self.update_with(id, patch, self.settings().enforce_references)
    }

    fn update_with(&self, id: &str, patch: &Value, check_references: bool) -> Result<Association> {
        let patch = as_object(patch, "patch")?;
        let mut records = self.raw()?;
        let index = Self::position(&records, id)?;

        let mut merged = shallow_merge(as_object(&records[index], "association")?, patch);
        merged.insert("updated_at".into(), Value::String(now()));

        let association = self.prepare(merged, &records, Some(index), check_references)?;
        records[index] = serde_json::to_value(&association)?;
        self.commit(records)?;
        self.emit(PersonaEvent::AssociationUpdated {
            id: association.id.clone(),
        })?;
        Ok(association)
    }

    pub fn remove_association(&self, id: &str) -> Result<()> {
        Self::position(&self.raw()?, id)?;
        self.emit(PersonaEvent::AssociationBeforeRemove { id: id.to_string() })?;

        let mut records = self.raw()?;
        records.retain(|r| record_id(r) != Some(id));
        self.commit(records)?;
        info!(id, "Association removed");
        self.emit(PersonaEvent::AssociationRemoved { id: id.to_string() })?;
        Ok(())
    }

    // ── Complex conditions ──

    /// The raw trigger of `id`, required to be of `expected` type.
    fn trigger_of(&self, id: &str, expected: &str, code: ErrorCode) -> Result<Map<String, Value>> {
        let records = self.raw()?;
        let index = Self::position(&records, id)?;
        let trigger = records[index]
            .get("trigger")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if trigger.get("type").and_then(Value::as_str) != Some(expected) {
            return Err(PersonaError::invalid(
                "trigger.type",
                code,
                format!("Association {id} is not a {expected} trigger"),
            ));
        }
        Ok(trigger)
    }

    fn conditions_of(trigger: &Map<String, Value>) -> Vec<Value> {
        trigger
            .get("conditions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn with_conditions(&self, id: &str, mut trigger: Map<String, Value>, conditions: Vec<Value>) -> Result<Association> {
        trigger.insert("conditions".into(), Value::Array(conditions));
        self.update_association(id, &json!({ "trigger": trigger }))
    }

    /// Append a condition. Returns the new condition count.
    pub fn add_complex_condition(&self, id: &str, condition: &Value) -> Result<usize> {
        let trigger = self.trigger_of(id, "complex", ErrorCode::NotComplexTrigger)?;
        let mut conditions = Self::conditions_of(&trigger);
        let max = self.settings().max_conditions;
        if conditions.len() >= max {
            return Err(PersonaError::invalid(
                "trigger.conditions",
                ErrorCode::MaxConditionsReached,
                format!("Complex trigger already has the maximum of {max} conditions"),
            ));
        }
        conditions.push(condition.clone());
        let updated = self.with_conditions(id, trigger, conditions)?;
        Ok(updated.trigger.conditions().len())
    }

    /// Remove the condition at `index`. The last condition cannot be removed.
    pub fn remove_complex_condition(&self, id: &str, index: usize) -> Result<usize> {
        let trigger = self.trigger_of(id, "complex", ErrorCode::NotComplexTrigger)?;
        let mut conditions = Self::conditions_of(&trigger);
        if index >= conditions.len() {
            return Err(PersonaError::invalid(
                "trigger.conditions",
                ErrorCode::InvalidConditionIndex,
                format!("Invalid condition index: {index}"),
            ));
        }
        if conditions.len() <= 1 {
            return Err(PersonaError::invalid(
                "trigger.conditions",
                ErrorCode::LastCondition,
                "Complex trigger must keep at least one condition",
            ));
        }
        conditions.remove(index);
        let updated = self.with_conditions(id, trigger, conditions)?;
        Ok(updated.trigger.conditions().len())
    }

    /// Shallow-merge `patch` into the condition at `index`.
    pub fn update_complex_condition(&self, id: &str, index: usize, patch: &Value) -> Result<Association> {
        let patch = as_object(patch, "condition")?;
        let trigger = self.trigger_of(id, "complex", ErrorCode::NotComplexTrigger)?;
        let mut conditions = Self::conditions_of(&trigger);
        let Some(current) = conditions.get(index).and_then(Value::as_object) else {
            return Err(PersonaError::invalid(
                "trigger.conditions",
                ErrorCode::InvalidConditionIndex,
                format!("Invalid condition index: {index}"),
            ));
        };
        conditions[index] = Value::Object(shallow_merge(current, patch));
        self.with_conditions(id, trigger, conditions)
    }

    // ── External triggers ──

    /// Replace the items of an external trigger; blanks are dropped, the rest trimmed.
    pub fn update_external_items(&self, id: &str, items: &[String]) -> Result<Vec<String>> {
        let mut trigger = self.trigger_of(id, "external", ErrorCode::NotExternalTrigger)?;
        let cleaned = validate::clean_items(items.iter().map(String::as_str));
        trigger.insert("items".into(), json!(cleaned));
        self.update_association(id, &json!({ "trigger": trigger }))?;
        Ok(cleaned)
    }

    /// Items of an external trigger; empty for other trigger types.
    pub fn external_items(&self, id: &str) -> Result<Vec<String>> {
        Ok(match self.get_association(id)?.trigger {
            Trigger::External { items, .. } => items,
            _ => Vec::new(),
        })
    }

    // ── Queries ──

    pub fn find_by_trigger(&self, kind: EntityKind, id: &str) -> Result<Vec<Association>> {
        let all = self.list()?;
        Ok(analysis::find_by_trigger(&all, kind, id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn find_by_response(&self, kind: ResponseKind, id: &str) -> Result<Vec<Association>> {
        let all = self.list()?;
        Ok(analysis::find_by_response(&all, kind, id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn analyze_network(&self) -> Result<NetworkAnalysis> {
        let known = self.known_ids()?;
        let mut memory_ids: Vec<&str> = known.memories.iter().map(String::as_str).collect();
        let mut emotion_ids: Vec<&str> = known.emotions.iter().map(String::as_str).collect();
        memory_ids.sort_unstable();
        emotion_ids.sort_unstable();
        Ok(analysis::analyze_network(&self.list()?, memory_ids, emotion_ids))
    }

    pub fn stats(&self) -> Result<AssociationStats> {
        Ok(analysis::stats(&self.list()?))
    }

    // ── Self-healing ──

    /// Regenerate duplicate, malformed and missing association ids.
    pub fn fix_ids(&self) -> Result<usize> {
        let mut records = self.raw()?;
        let fixes = fixup::fix_association_ids(&mut records);
        if fixes.is_empty() {
            return Ok(0);
        }
        for fix in &fixes {
            warn!(
                "Association id fixed at position {}: {:?} -> {}",
                fix.index, fix.old, fix.new
            );
        }
        self.commit(records)?;
        self.emit(PersonaEvent::AssociationIdsFixed { fixed: fixes.len() })?;
        Ok(fixes.len())
    }

    fn ensure_collection(&self) -> Result<()> {
        let store = self.store()?;
        if !matches!(store.get(paths::ASSOCIATIONS), Some(Value::Array(_))) {
            store.set(paths::ASSOCIATIONS, Value::Array(Vec::new()));
        }
        Ok(())
    }

    fn handle(&self, event: &PersonaEvent) -> Result<()> {
        match event {
            PersonaEvent::MemoryIdChanged { old_id, new_id } => {
                self.rename_references(EntityKind::Memory, old_id, new_id)?;
            }
            PersonaEvent::EmotionIdChanged { old_id, new_id } => {
                self.rename_references(EntityKind::Emotion, old_id, new_id)?;
            }
            PersonaEvent::MemoryBeforeRemove { id } => {
                self.remove_references(EntityKind::Memory, id)?;
            }
            PersonaEvent::EmotionBeforeRemove { id } => {
                self.remove_references(EntityKind::Emotion, id)?;
            }
            PersonaEvent::PersonaLoaded => {
                self.ensure_collection()?;
                self.fix_ids()?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl Cascadable for AssociationModule {
    fn rename_references(&self, kind: EntityKind, old_id: &str, new_id: &str) -> Result<usize> {
        let planned = cascade::plan_rename(&self.list()?, kind, old_id, new_id);
        let mut changed = 0;
        for association in planned {
            let patch = json!({
                "trigger": serde_json::to_value(&association.trigger)?,
                "response": serde_json::to_value(&association.response)?,
            });
            // Other references in the record may already dangle; only shape is re-checked.
            match self.update_with(&association.id, &patch, false) {
                Ok(_) => changed += 1,
                Err(e) => warn!(
                    "Cascade rename {} {} -> {} failed on {}: {}",
                    kind, old_id, new_id, association.id, e
                ),
            }
        }
        if changed > 0 {
            info!("Cascade rename {} {} -> {}: {} association(s) updated", kind, old_id, new_id, changed);
        }
        Ok(changed)
    }

    fn remove_references(&self, kind: EntityKind, id: &str) -> Result<usize> {
        // Collect first, then remove.
        let doomed = cascade::collect_dependents(&self.list()?, kind, id);
        let mut removed = 0;
        for association_id in doomed {
            match self.remove_association(&association_id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "Cascade delete for {} {} failed on {}: {}",
                    kind, id, association_id, e
                ),
            }
        }
        if removed > 0 {
            info!("Cascade delete {} {}: {} association(s) removed", kind, id, removed);
        }
        Ok(removed)
    }
}

impl EntityModule for AssociationModule {
    type Record = Association;

    fn kind(&self) -> EntityKind {
        EntityKind::Association
    }

    fn create(&self, draft: &Value) -> Result<String> {
        self.add_association(draft)
    }

    fn read(&self, id: &str) -> Result<Association> {
        self.get_association(id)
    }

    fn update(&self, id: &str, patch: &Value) -> Result<Association> {
        self.update_association(id, patch)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.remove_association(id)
    }

    fn list(&self) -> Result<Vec<Association>> {
        let store = self.store()?;
        Ok(stored_associations(&store))
    }
}

impl Module for AssociationModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["memory", "emotion"]
    }

    fn initialize(&self, ctx: &ModuleContext) -> Result<()> {
        self.inner.slot.attach(ctx);
        self.ensure_collection()?;

        for pattern in CASCADE_EVENTS {
            let weak = Rc::downgrade(&self.inner);
            self.inner.slot.listen(&ctx.bus, pattern, move |event| {
                if let Some(inner) = weak.upgrade() {
                    AssociationModule { inner }.handle(event)?;
                }
                Ok(())
            });
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.fix_ids()?;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.inner.slot.detach();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::modules::{EmotionModule, MemoryModule};
    use std::cell::RefCell;

    struct Fixture {
        ctx: ModuleContext,
        memories: MemoryModule,
        emotions: EmotionModule,
        associations: AssociationModule,
    }

    fn setup(settings: AssociationSettings) -> Fixture {
        let ctx = ModuleContext::new(Rc::new(PathStore::new()), Rc::new(EventBus::new()));
        let memories = MemoryModule::new();
        let emotions = EmotionModule::new();
        let associations = AssociationModule::new(settings);
        memories.initialize(&ctx).unwrap();
        emotions.initialize(&ctx).unwrap();
        associations.initialize(&ctx).unwrap();
        for id in ["m1", "m2"] {
            memories
                .create(&json!({"id": id, "type": "episodic", "content": id}))
                .unwrap();
        }
        Fixture {
            ctx,
            memories,
            emotions,
            associations,
        }
    }

    fn memory_to_joy(memory: &str) -> Value {
        json!({
            "trigger": {"type": "memory", "id": memory},
            "response": {"type": "emotion", "id": "joy", "association_strength": 50}
        })
    }

    fn complex_with(n: usize) -> Value {
        let conditions: Vec<Value> = (0..n)
            .map(|i| json!({"type": "emotion", "id": "fear", "threshold": i * 5}))
            .collect();
        json!({
            "trigger": {"type": "complex", "operator": "OR", "conditions": conditions},
            "response": {"type": "memory", "id": "m2", "association_strength": 40}
        })
    }

    #[test]
    fn test_add_assigns_id_and_defaults() {
        let f = setup(AssociationSettings::default());
        let id = f
            .associations
            .add_association(&json!({
                "trigger": {"type": "emotion", "id": "fear"},
                "response": {"type": "memory", "id": "m1"}
            }))
            .unwrap();
        assert_eq!(id, "assoc_1");

        let a = f.associations.get_association(&id).unwrap();
        assert_eq!(
            a.trigger,
            Trigger::Emotion {
                id: "fear".into(),
                threshold: 50
            }
        );
        assert_eq!(a.response.association_strength, 50);
        assert_eq!(f.associations.add_association(&memory_to_joy("m1")).unwrap(), "assoc_2");
    }

    #[test]
    fn test_dangling_reference_rejected_when_enforced() {
        let f = setup(AssociationSettings::default());
        let err = f
            .associations
            .add_association(&memory_to_joy("nonexistent"))
            .unwrap_err();
        assert!(err
            .validation()
            .unwrap()
            .has_code(ErrorCode::UnknownMemoryReference));
        assert!(f.associations.list().unwrap().is_empty());

        f.associations.set_settings(AssociationSettings {
            enforce_references: false,
            ..AssociationSettings::default()
        });
        assert!(f.associations.add_association(&memory_to_joy("nonexistent")).is_ok());
    }

    #[test]
    fn test_failed_update_leaves_collection_identical() {
        let f = setup(AssociationSettings::default());
        let id = f.associations.add_association(&memory_to_joy("m1")).unwrap();
        let before = f.ctx.store.get(paths::ASSOCIATIONS);

        let err = f
            .associations
            .update_association(&id, &json!({"trigger": {"type": "complex", "conditions": []}}))
            .unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::EmptyConditions));
        assert_eq!(f.ctx.store.get(paths::ASSOCIATIONS), before);

        assert!(matches!(
            f.associations.update_association("assoc_99", &json!({})),
            Err(PersonaError::NotFound { kind: EntityKind::Association, .. })
        ));
    }

    #[test]
    fn test_condition_bounds() {
        let f = setup(AssociationSettings::default());
        let id = f.associations.add_association(&complex_with(10)).unwrap();
        let before = f.ctx.store.get(paths::ASSOCIATIONS);

        let err = f
            .associations
            .add_complex_condition(&id, &json!({"type": "memory", "id": "m1"}))
            .unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::MaxConditionsReached));
        assert_eq!(f.ctx.store.get(paths::ASSOCIATIONS), before);

        for _ in 0..9 {
            f.associations.remove_complex_condition(&id, 0).unwrap();
        }
        let err = f.associations.remove_complex_condition(&id, 0).unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::LastCondition));
        let err = f.associations.remove_complex_condition(&id, 3).unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::InvalidConditionIndex));
    }

    #[test]
    fn test_condition_ops_require_complex_trigger() {
        let f = setup(AssociationSettings::default());
        let id = f.associations.add_association(&memory_to_joy("m1")).unwrap();
        let err = f
            .associations
            .add_complex_condition(&id, &json!({"type": "memory", "id": "m2"}))
            .unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::NotComplexTrigger));

        let complex = f.associations.add_association(&complex_with(2)).unwrap();
        let err = f
            .associations
            .add_complex_condition(&complex, &json!({"type": "complex", "conditions": []}))
            .unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::NestedComplexCondition));

        let updated = f
            .associations
            .update_complex_condition(&complex, 1, &json!({"threshold": 90}))
            .unwrap();
        assert_eq!(
            updated.trigger.conditions()[1],
            crate::types::Condition::Emotion {
                id: "fear".into(),
                threshold: 90
            }
        );
    }

    #[test]
    fn test_external_items() {
        let f = setup(AssociationSettings::default());
        let id = f
            .associations
            .add_association(&json!({
                "trigger": {"type": "external", "items": ["rain"]},
                "response": {"type": "emotion", "id": "sadness", "association_strength": 20}
            }))
            .unwrap();

        let items = f
            .associations
            .update_external_items(&id, &[" thunder ".into(), "".into(), "night".into()])
            .unwrap();
        assert_eq!(items, vec!["thunder", "night"]);
        assert_eq!(f.associations.external_items(&id).unwrap(), items);

        let err = f
            .associations
            .update_external_items(&id, &["   ".into()])
            .unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::EmptyExternalItems));
    }

    #[test]
    fn test_memory_rename_cascades_into_conditions() {
        let f = setup(AssociationSettings::default());
        let simple = f.associations.add_association(&memory_to_joy("m1")).unwrap();
        let complex = f
            .associations
            .add_association(&json!({
                "trigger": {"type": "complex", "operator": "AND", "conditions": [
                    {"type": "memory", "id": "m1"},
                    {"type": "emotion", "id": "fear", "threshold": 30}
                ]},
                "response": {"type": "memory", "id": "m1", "association_strength": 75}
            }))
            .unwrap();

        f.memories.rename("m1", "m9").unwrap();

        let a = f.associations.get_association(&simple).unwrap();
        assert_eq!(a.trigger, Trigger::Memory { id: "m9".into() });
        let c = f.associations.get_association(&complex).unwrap();
        assert!(c.references_entity(EntityKind::Memory, "m9"));
        assert!(!c.references_entity(EntityKind::Memory, "m1"));
    }

    #[test]
    fn test_memory_delete_cascades() {
        let f = setup(AssociationSettings::default());
        f.associations.add_association(&memory_to_joy("m1")).unwrap();
        let survivor = f.associations.add_association(&memory_to_joy("m2")).unwrap();

        let removed = Rc::new(RefCell::new(Vec::new()));
        let sink = removed.clone();
        f.ctx.bus.on("association:removed", move |e| {
            sink.borrow_mut().push(e.clone());
            Ok(())
        });

        f.memories.delete("m1").unwrap();
        let ids: Vec<String> = f.associations.list().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![survivor]);
        assert_eq!(
            *removed.borrow(),
            vec![PersonaEvent::AssociationRemoved { id: "assoc_1".into() }]
        );
    }

    #[test]
    fn test_emotion_rename_and_delete_cascade() {
        let f = setup(AssociationSettings::default());
        let id = f.associations.add_association(&memory_to_joy("m1")).unwrap();

        f.emotions.rename("joy", "delight").unwrap();
        assert_eq!(f.associations.get_association(&id).unwrap().response.id, "delight");

        f.emotions.delete("delight").unwrap();
        assert!(f.associations.list().unwrap().is_empty());
    }

    #[test]
    fn test_loaded_document_ids_are_healed() {
        let f = setup(AssociationSettings::default());
        let record = json!({
            "id": "dup",
            "trigger": {"type": "memory", "id": "m1"},
            "response": {"type": "emotion", "id": "joy", "association_strength": 50}
        });
        f.ctx
            .store
            .set(paths::ASSOCIATIONS, json!([record.clone(), record]));
        f.ctx.bus.emit(&PersonaEvent::PersonaLoaded);

        let ids: Vec<String> = f.associations.list().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["dup", "assoc_1"]);
        assert_eq!(f.associations.fix_ids().unwrap(), 0);
    }

    #[test]
    fn test_healed_memory_ids_carry_their_associations() {
        let f = setup(AssociationSettings::default());
        f.ctx.store.set(
            paths::MEMORIES,
            json!([
                {"id": "m1", "type": "episodic", "content": "a"},
                {"id": "bad id", "type": "episodic", "content": "b"},
                {"id": "m1", "type": "episodic", "content": "c"}
            ]),
        );
        f.ctx.store.set(
            paths::ASSOCIATIONS,
            json!([
                {"id": "a1", "trigger": {"type": "memory", "id": "bad id"},
                 "response": {"type": "emotion", "id": "joy", "association_strength": 50}},
                {"id": "a2", "trigger": {"type": "memory", "id": "m1"},
                 "response": {"type": "emotion", "id": "joy", "association_strength": 50}}
            ]),
        );

        assert_eq!(f.memories.fix_ids().unwrap(), 2);
        let ids: Vec<String> = f.memories.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m1", "memory_1", "memory_2"]);
        assert_eq!(
            f.associations.get_association("a1").unwrap().trigger,
            Trigger::Memory { id: "memory_1".into() }
        );
        assert_eq!(
            f.associations.get_association("a2").unwrap().trigger,
            Trigger::Memory { id: "m1".into() }
        );
    }

    #[test]
    fn test_analysis_through_module() {
        let f = setup(AssociationSettings::default());
        f.associations.add_association(&memory_to_joy("m1")).unwrap();
        let analysis = f.associations.analyze_network().unwrap();
        assert_eq!(analysis.memory_connections["m1"], 1);
        assert_eq!(analysis.memory_connections["m2"], 0);
        assert_eq!(analysis.emotion_connections["joy"], 1);
        assert_eq!(analysis.strength_distribution.medium, 1);

        assert_eq!(f.associations.find_by_trigger(EntityKind::Memory, "m1").unwrap().len(), 1);
        assert_eq!(
            f.associations
                .find_by_response(ResponseKind::Emotion, "joy")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_destroy_detaches_cascade_handlers() {
        let f = setup(AssociationSettings::default());
        f.associations.add_association(&memory_to_joy("m1")).unwrap();
        f.associations.destroy().unwrap();
        assert!(!f.ctx.bus.has_listeners("memory:before:remove"));
    }
}
