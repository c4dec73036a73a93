//! Module capabilities (lifecycle, entity CRUD and cascades) plus the
//! per-module attachment to the shared store and bus.

pub mod cognitive;
pub mod emotion;
pub mod memory;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ErrorCode, PersonaError, Result};
use crate::events::{EventBus, HandlerId, PersonaEvent};
use crate::store::PathStore;
use crate::types::EntityKind;

pub use cognitive::CognitiveModule;
pub use emotion::EmotionModule;
pub use memory::MemoryModule;

/// Handles every module receives at `initialize`.
#[derive(Clone)]
pub struct ModuleContext {
    pub store: Rc<PathStore>,
    pub bus: Rc<EventBus>,
}

impl ModuleContext {
    pub fn new(store: Rc<PathStore>, bus: Rc<EventBus>) -> Self {
        Self { store, bus }
    }
}

/// Lifecycle driven by the [`ModuleRegistry`](crate::registry::ModuleRegistry).
pub trait Module {
    fn name(&self) -> &'static str;

    /// Modules that must be initialized before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    fn initialize(&self, ctx: &ModuleContext) -> Result<()>;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()>;
}

/// CRUD over one entity collection. Drafts and patches are JSON objects so
/// unknown fields survive and every violation can be reported at once.
pub trait EntityModule {
    type Record;

    fn kind(&self) -> EntityKind;

    /// Validate, assign an id if absent, commit. Returns the id.
    fn create(&self, draft: &Value) -> Result<String>;

    fn read(&self, id: &str) -> Result<Self::Record>;

    /// Shallow-merge `patch`, re-validate the merged record, commit.
    fn update(&self, id: &str, patch: &Value) -> Result<Self::Record>;

    fn delete(&self, id: &str) -> Result<()>;

    fn list(&self) -> Result<Vec<Self::Record>>;

    fn exists(&self, id: &str) -> bool {
        self.read(id).is_ok()
    }
}

/// Keeps references to other entities valid when those entities change.
pub trait Cascadable {
    /// Rewrite every reference to `old_id`. Returns how many records changed.
    fn rename_references(&self, kind: EntityKind, old_id: &str, new_id: &str) -> Result<usize>;

    /// Drop every record referencing `id`. Returns how many were removed.
    fn remove_references(&self, kind: EntityKind, id: &str) -> Result<usize>;
}

// ── Attachment ──

/// A module's view of the store and bus once initialized.
///
/// The bus is held weakly: the bus owns the module's handlers, which in
/// turn hold the module.
#[derive(Clone)]
pub(crate) struct Attachment {
    pub store: Rc<PathStore>,
    bus: Weak<EventBus>,
}

impl Attachment {
    pub fn emit(&self, event: PersonaEvent) {
        if let Some(bus) = self.bus.upgrade() {
            bus.emit(&event);
        }
    }
}

#[derive(Default)]
pub(crate) struct ModuleSlot {
    attachment: RefCell<Option<Attachment>>,
    handlers: RefCell<Vec<HandlerId>>,
}

impl ModuleSlot {
    pub fn attach(&self, ctx: &ModuleContext) {
        *self.attachment.borrow_mut() = Some(Attachment {
            store: ctx.store.clone(),
            bus: Rc::downgrade(&ctx.bus),
        });
    }

    pub fn get(&self, module: &'static str) -> Result<Attachment> {
        self.attachment
            .borrow()
            .clone()
            .ok_or(PersonaError::NotInitialized(module))
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.borrow().is_some()
    }

    /// Subscribe on the bus and remember the handler for [`detach`](Self::detach).
    pub fn listen<F>(&self, bus: &EventBus, pattern: &str, handler: F)
    where
        F: Fn(&PersonaEvent) -> anyhow::Result<()> + 'static,
    {
        let id = bus.on(pattern, handler);
        self.handlers.borrow_mut().push(id);
    }

    pub fn detach(&self) {
        let attachment = self.attachment.borrow_mut().take();
        let handlers: Vec<HandlerId> = self.handlers.borrow_mut().drain(..).collect();
        if let Some(bus) = attachment.and_then(|a| a.bus.upgrade()) {
            for id in handlers {
                bus.off(id);
            }
        }
    }
}

// ── Shared record helpers ──

/// A map-stored record together with its key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keyed<T> {
    pub id: String,
    #[serde(flatten)]
    pub value: T,
}

/// The object at `path`, or an empty map when absent or not an object.
pub(crate) fn read_map(store: &PathStore, path: &str) -> Map<String, Value> {
    match store.get(path) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// The object inside a draft or patch, or an `INVALID_SHAPE` error.
pub(crate) fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        PersonaError::invalid(what, ErrorCode::InvalidShape, format!("{what} must be an object"))
    })
}

/// `base` with `patch`'s top-level keys overwritten.
pub(crate) fn shallow_merge(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Integer view of a JSON number, rounding fractions. Non-numbers are `None`.
pub(crate) fn rounded_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        _ => None,
    }
}

/// `prefix.name`, or just `name` at the top level.
pub(crate) fn field(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| PersonaError::invalid(what, ErrorCode::InvalidShape, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rounded_int() {
        assert_eq!(rounded_int(&json!(42)), Some(42));
        assert_eq!(rounded_int(&json!(41.6)), Some(42));
        assert_eq!(rounded_int(&json!(-0.4)), Some(0));
        assert_eq!(rounded_int(&json!("42")), None);
    }

    #[test]
    fn test_shallow_merge_replaces_top_level_only() {
        let base = json!({"a": {"x": 1}, "b": 2});
        let patch = json!({"a": {"y": 2}});
        let merged = shallow_merge(base.as_object().unwrap(), patch.as_object().unwrap());
        assert_eq!(Value::Object(merged), json!({"a": {"y": 2}, "b": 2}));
    }

    #[test]
    fn test_slot_requires_attach() {
        let slot = ModuleSlot::default();
        assert!(matches!(
            slot.get("memory"),
            Err(PersonaError::NotInitialized("memory"))
        ));

        let ctx = ModuleContext::new(Rc::new(PathStore::new()), Rc::new(EventBus::new()));
        slot.attach(&ctx);
        slot.listen(&ctx.bus, "persona:loaded", |_| Ok(()));
        assert_eq!(ctx.bus.handler_count(), 1);

        slot.detach();
        assert!(!slot.is_attached());
        assert_eq!(ctx.bus.handler_count(), 0);
    }
}
