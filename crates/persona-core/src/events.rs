//! PersonaEvent enum and the synchronous EventBus that carries it between modules.
//!
//! Handlers subscribe by pattern: an exact event name (`memory:removed`),
//! `*` for everything, or a `:`-segmented pattern where `*` matches one
//! segment and a trailing `*` matches the rest (`memory:*`, `*:removed`).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Every notification the editor core emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PersonaEvent {
    // ── Memories ──
    #[serde(rename = "memory:added")]
    MemoryAdded { id: String },

    #[serde(rename = "memory:updated")]
    MemoryUpdated { id: String },

    /// Committed under `new_id`; associations still point at `old_id`.
    #[serde(rename = "memory:id:changed")]
    MemoryIdChanged { old_id: String, new_id: String },

    /// The memory is still in the store while this is delivered.
    #[serde(rename = "memory:before:remove")]
    MemoryBeforeRemove { id: String },

    #[serde(rename = "memory:removed")]
    MemoryRemoved { id: String },

    #[serde(rename = "memory:validation:completed")]
    MemoryIdsFixed { fixed: usize },

    // ── Emotions ──
    #[serde(rename = "emotion:added")]
    EmotionAdded { id: String },

    #[serde(rename = "emotion:updated")]
    EmotionUpdated { id: String },

    #[serde(rename = "emotion:id:changed")]
    EmotionIdChanged { old_id: String, new_id: String },

    #[serde(rename = "emotion:before:remove")]
    EmotionBeforeRemove { id: String },

    #[serde(rename = "emotion:removed")]
    EmotionRemoved { id: String },

    #[serde(rename = "emotion:baseline:changed")]
    BaselineChanged { id: String, value: i64 },

    #[serde(rename = "emotion:state:changed")]
    EmotionStateChanged { id: String, value: i64 },

    /// `current_emotion_state` was rewritten wholesale (sync or reset).
    #[serde(rename = "emotion:state:synced")]
    EmotionStateSynced,

    #[serde(rename = "emotion:model:changed")]
    EmotionModelChanged { model: String },

    // ── Cognitive abilities ──
    #[serde(rename = "cognitive:ability:added")]
    AbilityAdded { id: String },

    #[serde(rename = "cognitive:ability:updated")]
    AbilityUpdated { id: String },

    #[serde(rename = "cognitive:ability:removed")]
    AbilityRemoved { id: String },

    #[serde(rename = "cognitive:model:changed")]
    CognitiveModelChanged { model: String },

    // ── Associations ──
    #[serde(rename = "association:added")]
    AssociationAdded { id: String },

    #[serde(rename = "association:updated")]
    AssociationUpdated { id: String },

    #[serde(rename = "association:before:remove")]
    AssociationBeforeRemove { id: String },

    #[serde(rename = "association:removed")]
    AssociationRemoved { id: String },

    #[serde(rename = "association:validation:completed")]
    AssociationIdsFixed { fixed: usize },

    // ── Document ──
    /// A whole document was placed in the store (import, restore, load).
    #[serde(rename = "persona:loaded")]
    PersonaLoaded,

    #[serde(rename = "persona:saved")]
    PersonaSaved { key: String },

    #[serde(rename = "persona:exported")]
    PersonaExported,

    // ── Module lifecycle ──
    #[serde(rename = "module:registered")]
    ModuleRegistered { name: String },

    #[serde(rename = "module:initialized")]
    ModuleInitialized { name: String },

    #[serde(rename = "module:started")]
    ModuleStarted { name: String },

    #[serde(rename = "module:stopped")]
    ModuleStopped { name: String },

    #[serde(rename = "module:destroyed")]
    ModuleDestroyed { name: String },

    #[serde(rename = "module:unloaded")]
    ModuleUnloaded { name: String },
}

impl PersonaEvent {
    /// The `:`-segmented name handlers match against.
    pub fn name(&self) -> &'static str {
        match self {
            PersonaEvent::MemoryAdded { .. } => "memory:added",
            PersonaEvent::MemoryUpdated { .. } => "memory:updated",
            PersonaEvent::MemoryIdChanged { .. } => "memory:id:changed",
            PersonaEvent::MemoryBeforeRemove { .. } => "memory:before:remove",
            PersonaEvent::MemoryRemoved { .. } => "memory:removed",
            PersonaEvent::MemoryIdsFixed { .. } => "memory:validation:completed",
            PersonaEvent::EmotionAdded { .. } => "emotion:added",
            PersonaEvent::EmotionUpdated { .. } => "emotion:updated",
            PersonaEvent::EmotionIdChanged { .. } => "emotion:id:changed",
            PersonaEvent::EmotionBeforeRemove { .. } => "emotion:before:remove",
            PersonaEvent::EmotionRemoved { .. } => "emotion:removed",
            PersonaEvent::BaselineChanged { .. } => "emotion:baseline:changed",
            PersonaEvent::EmotionStateChanged { .. } => "emotion:state:changed",
            PersonaEvent::EmotionStateSynced => "emotion:state:synced",
            PersonaEvent::EmotionModelChanged { .. } => "emotion:model:changed",
            PersonaEvent::AbilityAdded { .. } => "cognitive:ability:added",
            PersonaEvent::AbilityUpdated { .. } => "cognitive:ability:updated",
            PersonaEvent::AbilityRemoved { .. } => "cognitive:ability:removed",
            PersonaEvent::CognitiveModelChanged { .. } => "cognitive:model:changed",
            PersonaEvent::AssociationAdded { .. } => "association:added",
            PersonaEvent::AssociationUpdated { .. } => "association:updated",
            PersonaEvent::AssociationBeforeRemove { .. } => "association:before:remove",
            PersonaEvent::AssociationRemoved { .. } => "association:removed",
            PersonaEvent::AssociationIdsFixed { .. } => "association:validation:completed",
            PersonaEvent::PersonaLoaded => "persona:loaded",
            PersonaEvent::PersonaSaved { .. } => "persona:saved",
            PersonaEvent::PersonaExported => "persona:exported",
            PersonaEvent::ModuleRegistered { .. } => "module:registered",
            PersonaEvent::ModuleInitialized { .. } => "module:initialized",
            PersonaEvent::ModuleStarted { .. } => "module:started",
            PersonaEvent::ModuleStopped { .. } => "module:stopped",
            PersonaEvent::ModuleDestroyed { .. } => "module:destroyed",
            PersonaEvent::ModuleUnloaded { .. } => "module:unloaded",
        }
    }

    /// `{"event": "...", "data": {...}}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

// ── Bus ──

pub type HandlerFn = dyn Fn(&PersonaEvent) -> anyhow::Result<()>;

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Handler {
    id: HandlerId,
    pattern: String,
    once: bool,
    callback: Rc<HandlerFn>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub emitted: u64,
    pub handled: u64,
    pub errors: u64,
}

#[derive(Default)]
pub struct EventBus {
    handlers: RefCell<Vec<Handler>>,
    next_id: Cell<u64>,
    stats: Cell<EventStats>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, pattern: &str, handler: F) -> HandlerId
    where
        F: Fn(&PersonaEvent) -> anyhow::Result<()> + 'static,
    {
        self.register(pattern, false, Rc::new(handler))
    }

    /// Like [`on`](Self::on), removed after its first delivery.
    pub fn once<F>(&self, pattern: &str, handler: F) -> HandlerId
    where
        F: Fn(&PersonaEvent) -> anyhow::Result<()> + 'static,
    {
        self.register(pattern, true, Rc::new(handler))
    }

    fn register(&self, pattern: &str, once: bool, callback: Rc<HandlerFn>) -> HandlerId {
        let id = HandlerId(self.next_id.get() + 1);
        self.next_id.set(id.0);
        self.handlers.borrow_mut().push(Handler {
            id,
            pattern: pattern.to_string(),
            once,
            callback,
        });
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Remove every handler registered under exactly `pattern`.
    pub fn off_pattern(&self, pattern: &str) -> usize {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|h| h.pattern != pattern);
        before - handlers.len()
    }

    pub fn clear(&self) {
        self.handlers.borrow_mut().clear();
    }

    /// Deliver `event` to every matching handler, in registration order.
    /// Returns how many handlers ran. Handler errors are logged, never propagated.
    pub fn emit(&self, event: &PersonaEvent) -> usize {
        let name = event.name();
        let targets: Vec<(String, Rc<HandlerFn>)> = {
            let mut handlers = self.handlers.borrow_mut();
            let matched = handlers
                .iter()
                .filter(|h| pattern_matches(&h.pattern, name))
                .map(|h| (h.pattern.clone(), h.callback.clone()))
                .collect();
            handlers.retain(|h| !(h.once && pattern_matches(&h.pattern, name)));
            matched
        };
        debug!(event = name, handlers = targets.len(), "emit");

        let mut stats = self.stats.get();
        stats.emitted += 1;
        self.stats.set(stats);

        let mut failures = 0;
        for (pattern, callback) in &targets {
            if let Err(e) = callback(event) {
                failures += 1;
                error!("Handler '{}' failed on {}: {:#}", pattern, name, e);
            }
        }

        // Re-read: nested emits from handlers have updated the counters meanwhile.
        let mut stats = self.stats.get();
        stats.handled += targets.len() as u64;
        stats.errors += failures;
        self.stats.set(stats);
        targets.len()
    }

    pub fn has_listeners(&self, event_name: &str) -> bool {
        self.handlers
            .borrow()
            .iter()
            .any(|h| pattern_matches(&h.pattern, event_name))
    }

    /// Distinct registered patterns, in first-registration order.
    pub fn list_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for h in self.handlers.borrow().iter() {
            if !patterns.contains(&h.pattern) {
                patterns.push(h.pattern.clone());
            }
        }
        patterns
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn stats(&self) -> EventStats {
        self.stats.get()
    }
}

/// Match an event name against a subscription pattern.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == name {
        return true;
    }
    let pattern_parts: Vec<&str> = pattern.split(':').collect();
    let name_parts: Vec<&str> = name.split(':').collect();
    let last = pattern_parts.len() - 1;

    for (i, segment) in pattern_parts.iter().enumerate() {
        let Some(part) = name_parts.get(i) else {
            return false;
        };
        if *segment == "*" {
            if i == last {
                return true;
            }
            continue;
        }
        if segment != part {
            return false;
        }
    }
    pattern_parts.len() == name_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(id: &str) -> PersonaEvent {
        PersonaEvent::MemoryRemoved { id: id.into() }
    }

    #[test]
    fn test_event_json_shape() {
        let event = PersonaEvent::MemoryIdChanged {
            old_id: "m1".into(),
            new_id: "m2".into(),
        };
        let json = event.to_json();
        assert_eq!(json["event"], "memory:id:changed");
        assert_eq!(json["data"]["old_id"], "m1");
        assert_eq!(json["event"], event.name());
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "memory:removed"));
        assert!(pattern_matches("memory:removed", "memory:removed"));
        assert!(pattern_matches("memory:*", "memory:removed"));
        assert!(pattern_matches("memory:*", "memory:id:changed"));
        assert!(pattern_matches("*:removed", "association:removed"));
        assert!(!pattern_matches("*:removed", "association:before:remove"));
        assert!(!pattern_matches("memory:*", "memory"));
        assert!(!pattern_matches("memory:added", "memory:added:extra"));
        assert!(!pattern_matches("emotion:*", "memory:removed"));
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let sink = order.clone();
            bus.on("memory:removed", move |_| {
                sink.borrow_mut().push(tag);
                Ok(())
            });
        }
        assert_eq!(bus.emit(&removed("m1")), 3);
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        let bus = EventBus::new();
        let reached = Rc::new(Cell::new(false));
        bus.on("*", |_| anyhow::bail!("listener crashed"));
        let flag = reached.clone();
        bus.on("memory:removed", move |_| {
            flag.set(true);
            Ok(())
        });

        bus.emit(&removed("m1"));
        assert!(reached.get());
        let stats = bus.stats();
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.handled, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_once_and_off() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let c1 = count.clone();
        bus.once("memory:*", move |_| {
            c1.set(c1.get() + 1);
            Ok(())
        });
        let c2 = count.clone();
        let id = bus.on("memory:removed", move |_| {
            c2.set(c2.get() + 10);
            Ok(())
        });

        bus.emit(&removed("a"));
        bus.emit(&removed("b"));
        assert_eq!(count.get(), 21);

        assert!(bus.off(id));
        bus.emit(&removed("c"));
        assert_eq!(count.get(), 21);
        assert!(!bus.has_listeners("memory:removed"));
    }

    #[test]
    fn test_nested_emit_from_handler() {
        let bus = Rc::new(EventBus::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let inner = Rc::downgrade(&bus);
        bus.on("memory:before:remove", move |event| {
            if let (Some(bus), PersonaEvent::MemoryBeforeRemove { id }) = (inner.upgrade(), event) {
                bus.emit(&PersonaEvent::AssociationRemoved { id: format!("for_{id}") });
            }
            Ok(())
        });
        let sink = seen.clone();
        bus.on("association:removed", move |event| {
            sink.borrow_mut().push(event.clone());
            Ok(())
        });

        bus.emit(&PersonaEvent::MemoryBeforeRemove { id: "m1".into() });
        assert_eq!(
            *seen.borrow(),
            vec![PersonaEvent::AssociationRemoved { id: "for_m1".into() }]
        );
        assert_eq!(bus.stats().emitted, 2);
    }

    #[test]
    fn test_list_patterns_and_clear() {
        let bus = EventBus::new();
        bus.on("memory:*", |_| Ok(()));
        bus.on("*", |_| Ok(()));
        bus.on("memory:*", |_| Ok(()));
        assert_eq!(bus.list_patterns(), vec!["memory:*", "*"]);
        assert_eq!(bus.off_pattern("memory:*"), 2);
        bus.clear();
        assert_eq!(bus.handler_count(), 0);
    }
}
