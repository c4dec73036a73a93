//! MemoryModule: CRUD over `persona.memory_system.memories`.
//!
//! Removing a memory emits `memory:before:remove` while the record is still
//! present, so association cascades can run first; an id change is
//! committed and then announced with `memory:id:changed`.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{
    as_object, decode, field, now, shallow_merge, EntityModule, Module, ModuleContext, ModuleSlot,
};
use crate::association;
use crate::error::{ErrorCode, PersonaError, Result, ValidationErrors};
use crate::events::PersonaEvent;
use crate::ids;
use crate::store::paths;
use crate::types::{EntityKind, Memory, MemoryType};

pub const MODULE_NAME: &str = "memory";
pub const ID_PREFIX: &str = "memory";
pub const MAX_CONTENT_LENGTH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// Field checks for one memory record. Uniqueness is the caller's concern.
pub fn validate_memory(record: &Map<String, Value>, prefix: &str) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    match record.get("id") {
        None | Some(Value::Null) => {}
        Some(Value::String(id)) if ids::is_valid_id(id) => {}
        Some(other) => errors.push(
            field(prefix, "id"),
            ErrorCode::InvalidIdFormat,
            format!("Invalid ID format: {}", display_value(other)),
        ),
    }

    match record.get("type") {
        None | Some(Value::Null) => errors.push(
            field(prefix, "type"),
            ErrorCode::MissingType,
            "Memory type is required",
        ),
        Some(Value::String(t)) if MemoryType::parse(t).is_some() => {}
        Some(other) => errors.push(
            field(prefix, "type"),
            ErrorCode::UnsupportedType,
            format!("Unsupported memory type: {}", display_value(other)),
        ),
    }

    match record.get("content").and_then(Value::as_str) {
        Some(content) if !content.trim().is_empty() => {
            let len = content.chars().count();
            if len > MAX_CONTENT_LENGTH {
                errors.push(
                    field(prefix, "content"),
                    ErrorCode::ContentTooLong,
                    format!("Content too long: {len} chars (max {MAX_CONTENT_LENGTH})"),
                );
            }
        }
        _ => errors.push(
            field(prefix, "content"),
            ErrorCode::MissingContent,
            "Memory content is required",
        ),
    }

    if let Some(valence) = record.get("emotional_valence") {
        let in_range = valence
            .as_f64()
            .is_some_and(|v| (0.0..=1.0).contains(&v));
        if !in_range {
            errors.push(
                field(prefix, "emotional_valence"),
                ErrorCode::InvalidValence,
                "Emotional valence must be between 0 and 1",
            );
        }
    }

    errors
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct MemoryInner {
    slot: ModuleSlot,
}

#[derive(Clone)]
pub struct MemoryModule {
    inner: Rc<MemoryInner>,
}

impl Default for MemoryModule {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryModule {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(MemoryInner {
                slot: ModuleSlot::default(),
            }),
        }
    }

    fn raw(&self) -> Result<Vec<Value>> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        Ok(match attachment.store.get(paths::MEMORIES) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        })
    }

    fn commit(&self, records: Vec<Value>) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        attachment.store.set(paths::MEMORIES, Value::Array(records));
        Ok(())
    }

    fn emit(&self, event: PersonaEvent) -> Result<()> {
        self.inner.slot.get(MODULE_NAME)?.emit(event);
        Ok(())
    }

    fn ids_of(records: &[Value]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_str))
            .map(String::from)
            .collect()
    }

    fn position(records: &[Value], id: &str) -> Option<usize> {
        records
            .iter()
            .position(|r| r.get("id").and_then(Value::as_str) == Some(id))
    }

    /// `update(old_id, {"id": new_id})`.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<Memory> {
        self.update(old_id, &json!({ "id": new_id }))
    }

    pub fn memories_by_type(&self, memory_type: MemoryType) -> Result<Vec<Memory>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.memory_type == memory_type)
            .collect())
    }

    /// Memory ids referenced by any association, sorted.
    pub fn referenced_memories(&self) -> Result<Vec<String>> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        let referenced: BTreeSet<String> = association::stored_associations(&attachment.store)
            .iter()
            .flat_map(|a| a.references())
            .filter(|(kind, _)| *kind == EntityKind::Memory)
            .map(|(_, id)| id.to_string())
            .collect();
        Ok(referenced.into_iter().collect())
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let memories = self.list()?;
        let mut by_type: BTreeMap<String, usize> = MemoryType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();
        for memory in &memories {
            *by_type.entry(memory.memory_type.as_str().to_string()).or_default() += 1;
        }
        Ok(MemoryStats {
            total: memories.len(),
            by_type,
        })
    }

    /// Rewrite missing, malformed and duplicate memory ids. Returns how many changed.
    ///
    /// A malformed id that no longer names any memory is announced with
    /// `memory:id:changed` so references follow it. Duplicates keep their
    /// first holder, so references to them are left alone.
    pub fn fix_ids(&self) -> Result<usize> {
        let mut records = self.raw()?;
        let mut slots: Vec<Option<String>> = records
            .iter()
            .map(|r| r.get("id").and_then(Value::as_str).map(String::from))
            .collect();
        let fixed = ids::heal_ids(&mut slots, ID_PREFIX);
        if fixed.is_empty() {
            return Ok(0);
        }

        let remaining: BTreeSet<String> = slots.iter().flatten().cloned().collect();
        for (record, id) in records.iter_mut().zip(slots) {
            if let (Value::Object(map), Some(id)) = (record, id) {
                map.insert("id".into(), Value::String(id));
            }
        }
        for (old, new) in &fixed {
            warn!("Memory id fixed: {:?} -> {}", old, new);
        }
        self.commit(records)?;

        let mut announced = BTreeSet::new();
        for (old, new) in &fixed {
            let Some(old) = old else { continue };
            if remaining.contains(old) || !announced.insert(old.clone()) {
                continue;
            }
            self.emit(PersonaEvent::MemoryIdChanged {
                old_id: old.clone(),
                new_id: new.clone(),
            })?;
        }
        self.emit(PersonaEvent::MemoryIdsFixed { fixed: fixed.len() })?;
        Ok(fixed.len())
    }

    fn ensure_collection(&self) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        if !matches!(attachment.store.get(paths::MEMORIES), Some(Value::Array(_))) {
            attachment.store.set(paths::MEMORIES, Value::Array(Vec::new()));
        }
        Ok(())
    }
}

impl EntityModule for MemoryModule {
    type Record = Memory;

    fn kind(&self) -> EntityKind {
        EntityKind::Memory
    }

    fn create(&self, draft: &Value) -> Result<String> {
        let draft = as_object(draft, "memory")?;
        let mut records = self.raw()?;
        let existing = Self::ids_of(&records);

        let mut errors = validate_memory(draft, "");
        let id = match draft.get("id").and_then(Value::as_str) {
            Some(id) => {
                if existing.iter().any(|e| e == id) {
                    errors.push("id", ErrorCode::DuplicateId, format!("Duplicate ID: {id}"));
                }
                id.to_string()
            }
            None => ids::first_unused(ID_PREFIX, existing.iter().map(String::as_str)),
        };
        errors.into_result()?;

        let stamp = now();
        let mut record = draft.clone();
        record.insert("id".into(), Value::String(id.clone()));
        record.entry("period").or_insert_with(|| json!(""));
        record.entry("emotional_valence").or_insert_with(|| json!(0.5));
        record.entry("metadata").or_insert_with(|| json!({}));
        record.insert("created_at".into(), Value::String(stamp.clone()));
        record.insert("updated_at".into(), Value::String(stamp));
        let memory: Memory = decode(Value::Object(record), "memory")?;

        records.push(serde_json::to_value(&memory)?);
        self.commit(records)?;
        info!(id = %id, memory_type = %memory.memory_type, "Memory added");
        self.emit(PersonaEvent::MemoryAdded { id: id.clone() })?;
        Ok(id)
    }

    fn read(&self, id: &str) -> Result<Memory> {
        let records = self.raw()?;
        let record = Self::position(&records, id)
            .map(|i| records[i].clone())
            .ok_or_else(|| PersonaError::not_found(EntityKind::Memory, id))?;
        decode(record, "memory")
    }

    fn update(&self, id: &str, patch: &Value) -> Result<Memory> {
        let patch = as_object(patch, "patch")?;
        let mut records = self.raw()?;
        let index = Self::position(&records, id)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Memory, id))?;
        let current = as_object(&records[index], "memory")?;

        let mut merged = shallow_merge(current, patch);
        merged.insert("updated_at".into(), Value::String(now()));

        let mut errors = validate_memory(&merged, "");
        let new_id = match merged.get("id") {
            Some(Value::String(new_id)) => new_id.clone(),
            _ => {
                errors.push("id", ErrorCode::MissingId, "Memory id is required");
                id.to_string()
            }
        };
        if new_id != id && records.iter().enumerate().any(|(i, r)| {
            i != index && r.get("id").and_then(Value::as_str) == Some(new_id.as_str())
        }) {
            errors.push("id", ErrorCode::DuplicateId, format!("Duplicate ID: {new_id}"));
        }
        errors.into_result()?;

        let memory: Memory = decode(Value::Object(merged), "memory")?;
        records[index] = serde_json::to_value(&memory)?;
        self.commit(records)?;

        if new_id != id {
            info!("Memory renamed: {} -> {}", id, new_id);
            self.emit(PersonaEvent::MemoryIdChanged {
                old_id: id.to_string(),
                new_id: new_id.clone(),
            })?;
        }
        self.emit(PersonaEvent::MemoryUpdated { id: new_id })?;
        Ok(memory)
    }

    fn delete(&self, id: &str) -> Result<()> {
        if Self::position(&self.raw()?, id).is_none() {
            return Err(PersonaError::not_found(EntityKind::Memory, id));
        }

        self.emit(PersonaEvent::MemoryBeforeRemove { id: id.to_string() })?;

        // Handlers may have written to the store; start from the current collection.
        let mut records = self.raw()?;
        records.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        self.commit(records)?;
        info!(id, "Memory removed");
        self.emit(PersonaEvent::MemoryRemoved { id: id.to_string() })?;
        Ok(())
    }

    /// Decodable memories in collection order. Malformed records are skipped.
    fn list(&self) -> Result<Vec<Memory>> {
        Ok(self
            .raw()?
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<Memory>(record) {
                Ok(memory) => Some(memory),
                Err(e) => {
                    warn!("Skipping malformed memory record: {}", e);
                    None
                }
            })
            .collect())
    }

    fn exists(&self, id: &str) -> bool {
        self.raw()
            .map(|records| Self::position(&records, id).is_some())
            .unwrap_or(false)
    }
}

impl Module for MemoryModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn initialize(&self, ctx: &ModuleContext) -> Result<()> {
        self.inner.slot.attach(ctx);
        self.ensure_collection()?;

        let weak = Rc::downgrade(&self.inner);
        self.inner
            .slot
            .listen(&ctx.bus, "persona:loaded", move |_| {
                if let Some(inner) = weak.upgrade() {
                    let module = MemoryModule { inner };
                    module.ensure_collection()?;
                    module.fix_ids()?;
                }
                Ok(())
            });
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
