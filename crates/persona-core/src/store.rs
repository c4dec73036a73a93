//! PathStore: a single JSON document addressed by dot-delimited paths,
//! with synchronous prefix-aware change notification.
//!
//! Delivery order for a write at `a.b.c`: subscribers of `a.b.c` itself,
//! then ancestors from the deepest (`a.b`) to the root (`a`, then `""`),
//! then subscribers of descendants (`a.b.c.d`). Exact subscribers receive the
//! written value; every other subscriber receives whatever now lives at its
//! own path (`None` if the write removed it).
//!
//! No borrow is held while a callback runs, so callbacks may read, write and
//! subscribe re-entrantly. A callback returning `Err` is logged and does not
//! stop delivery to the others.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::StoreError;

/// Well-known document paths.
pub mod paths {
    pub const PERSONA: &str = "persona";
    pub const MEMORY_SYSTEM: &str = "persona.memory_system";
    pub const MEMORIES: &str = "persona.memory_system.memories";
    pub const EMOTION_SYSTEM: &str = "persona.emotion_system";
    pub const EMOTION_MODEL: &str = "persona.emotion_system.model";
    pub const EMOTIONS: &str = "persona.emotion_system.emotions";
    pub const CURRENT_EMOTION_STATE: &str = "persona.current_emotion_state";
    pub const ASSOCIATION_SYSTEM: &str = "persona.association_system";
    pub const ASSOCIATIONS: &str = "persona.association_system.associations";
    pub const COGNITIVE_SYSTEM: &str = "persona.cognitive_system";
    pub const COGNITIVE_MODEL: &str = "persona.cognitive_system.model";
    pub const ABILITIES: &str = "persona.cognitive_system.abilities";
    pub const APP: &str = "app";
}

pub type SubscriberFn = dyn Fn(Option<&Value>) -> anyhow::Result<()>;

/// Handle returned by [`PathStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    path: String,
    callback: Rc<SubscriberFn>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Relation {
    Exact,
    Ancestor,
    Descendant,
}

pub struct PathStore {
    root: RefCell<Value>,
    subscribers: RefCell<Vec<Subscriber>>,
    next_id: Cell<u64>,
}

impl Default for PathStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PathStore {
    pub fn new() -> Self {
        Self::with_root(Value::Object(Map::new()))
    }

    pub fn with_root(root: Value) -> Self {
        Self {
            root: RefCell::new(root),
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    // ── Reads ──

    /// Value at `path`, or `None` if any segment is absent. `""` is the root.
    pub fn get(&self, path: &str) -> Option<Value> {
        let root = self.root.borrow();
        lookup(&root, path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        let root = self.root.borrow();
        lookup(&root, path).is_some()
    }

    /// Decode the value at `path`. Absent paths decode to `None`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StoreError> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    path: path.to_string(),
                    source,
                }),
        }
    }

    /// Deep copy of the whole document.
    pub fn snapshot(&self) -> Value {
        self.root.borrow().clone()
    }

    // ── Writes ──

    /// Assign `value` at `path`, creating intermediate objects as needed.
    pub fn set(&self, path: &str, value: Value) {
        {
            let mut root = self.root.borrow_mut();
            assign(&mut root, path, value.clone());
        }
        debug!(path, "store set");
        self.notify(path, Some(&value));
    }

    pub fn set_as<T: Serialize>(&self, path: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
            path: path.to_string(),
            source,
        })?;
        self.set(path, value);
        Ok(())
    }

    /// Shallow-merge `patch` into the object at `path` (a non-object is replaced).
    pub fn merge(&self, path: &str, patch: Map<String, Value>) {
        let mut merged = match self.get(path) {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        merged.extend(patch);
        self.set(path, Value::Object(merged));
    }

    /// Remove the leaf at `path`. Absent paths are a silent no-op.
    pub fn delete(&self, path: &str) -> bool {
        let removed = {
            let mut root = self.root.borrow_mut();
            remove(&mut root, path)
        };
        if removed {
            debug!(path, "store delete");
            self.notify(path, None);
        }
        removed
    }

    /// Swap in a whole new document and notify every subscriber.
    pub fn replace_root(&self, root: Value) {
        *self.root.borrow_mut() = root;
        self.notify_all();
    }

    /// Empty the document and notify every subscriber.
    pub fn reset(&self) {
        self.replace_root(Value::Object(Map::new()));
    }

    // ── Subscriptions ──

    /// Run `callback` on every write touching `path`, its ancestors' writes
    /// included. `""` subscribes to everything.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&Value>) -> anyhow::Result<()> + 'static,
    {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.subscribers.borrow_mut().push(Subscriber {
            id,
            path: path.to_string(),
            callback: Rc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.borrow_mut();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    fn notify(&self, path: &str, value: Option<&Value>) {
        // Snapshot matching callbacks so none is borrowed during delivery.
        let mut targets: Vec<(Relation, usize, String, Rc<SubscriberFn>)> = self
            .subscribers
            .borrow()
            .iter()
            .filter_map(|s| {
                relation(&s.path, path).map(|rel| {
                    (rel, segment_count(&s.path), s.path.clone(), s.callback.clone())
                })
            })
            .collect();

        // exact, ancestors deepest first, then descendants; registration order within a tier
        targets.sort_by_key(|(rel, depth, _, _)| match rel {
            Relation::Exact => (0, 0),
            Relation::Ancestor => (1, usize::MAX - depth),
            Relation::Descendant => (2, *depth),
        });

        for (rel, _, sub_path, callback) in targets {
            let result = match rel {
                Relation::Exact => callback(value),
                _ => {
                    let current = self.get(&sub_path);
                    callback(current.as_ref())
                }
            };
            if let Err(e) = result {
                error!("Subscriber for '{}' failed on write to '{}': {:#}", sub_path, path, e);
            }
        }
    }

    fn notify_all(&self) {
        let targets: Vec<(String, Rc<SubscriberFn>)> = self
            .subscribers
            .borrow()
            .iter()
            .map(|s| (s.path.clone(), s.callback.clone()))
            .collect();
        for (sub_path, callback) in targets {
            let current = self.get(&sub_path);
            if let Err(e) = callback(current.as_ref()) {
                error!("Subscriber for '{}' failed on reset: {:#}", sub_path, e);
            }
        }
    }
}

// ── Path helpers ──

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn segment_count(path: &str) -> usize {
    segments(path).count()
}

/// How a subscriber at `sub` relates to a write at `written`.
fn relation(sub: &str, written: &str) -> Option<Relation> {
    let sub_parts: Vec<&str> = segments(sub).collect();
    let written_parts: Vec<&str> = segments(written).collect();
    let shared = sub_parts.len().min(written_parts.len());
    if sub_parts[..shared] != written_parts[..shared] {
        return None;
    }
    Some(match sub_parts.len().cmp(&written_parts.len()) {
        std::cmp::Ordering::Equal => Relation::Exact,
        std::cmp::Ordering::Less => Relation::Ancestor,
        std::cmp::Ordering::Greater => Relation::Descendant,
    })
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(root, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn assign(root: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = parts.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for key in parents {
        current = child_mut(current, key);
    }

    let array_slot = match &*current {
        Value::Array(items) => last.parse::<usize>().ok().filter(|i| *i <= items.len()),
        _ => None,
    };
    if array_slot.is_none() && !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match (current, array_slot) {
        (Value::Array(items), Some(i)) if i == items.len() => items.push(value),
        (Value::Array(items), Some(i)) => items[i] = value,
        (Value::Object(map), _) => {
            map.insert(last.to_string(), value);
        }
        _ => {}
    }
}

/// Descend into `key`, turning missing or scalar intermediates into objects.
fn child_mut<'a>(current: &'a mut Value, key: &str) -> &'a mut Value {
    let array_slot = match &*current {
        Value::Array(items) => key.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    if array_slot.is_none() && !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match (current, array_slot) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (other, _) => {
            if !other.is_object() {
                *other = Value::Object(Map::new());
            }
            let Value::Object(map) = other else {
                unreachable!("intermediate was just replaced with an object")
            };
            let child = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !(child.is_object() || child.is_array()) {
                *child = Value::Object(Map::new());
            }
            child
        }
    }
}

fn remove(root: &mut Value, path: &str) -> bool {
    let parts: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = parts.split_last() else {
        return false;
    };
    let mut current = root;
    for key in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(*key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return false,
        }
    }
    match current {
        Value::Object(map) => map.remove(*last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(store: &PathStore, path: &str) -> Rc<RefCell<Vec<Option<Value>>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(path, move |v| {
            sink.borrow_mut().push(v.cloned());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_get_missing_segments_is_none() {
        let store = PathStore::new();
        assert_eq!(store.get("a.b.c"), None);
        store.set("a.b", json!(5));
        assert_eq!(store.get("a.b.c"), None);
        assert_eq!(store.get("a.b"), Some(json!(5)));
        assert_eq!(store.get(""), Some(json!({"a": {"b": 5}})));
    }

    #[test]
    fn test_set_creates_intermediates_and_replaces_scalars() {
        let store = PathStore::new();
        store.set("x", json!(1));
        store.set("x.y.z", json!("deep"));
        assert_eq!(store.get("x"), Some(json!({"y": {"z": "deep"}})));
    }

    #[test]
    fn test_array_index_segments() {
        let store = PathStore::new();
        store.set("list", json!([{"id": "a"}, {"id": "b"}]));
        assert_eq!(store.get("list.1.id"), Some(json!("b")));
        store.set("list.0.id", json!("z"));
        assert_eq!(store.get("list.0.id"), Some(json!("z")));
        assert!(store.delete("list.0"));
        assert_eq!(store.get("list"), Some(json!([{"id": "b"}])));
    }

    #[test]
    fn test_exact_and_ancestor_notification() {
        let store = PathStore::new();
        let exact = recorder(&store, "persona.memory_system.memories");
        let parent = recorder(&store, "persona.memory_system");
        let sibling = recorder(&store, "persona.emotion_system");

        store.set("persona.memory_system.memories", json!([1]));

        assert_eq!(*exact.borrow(), vec![Some(json!([1]))]);
        assert_eq!(*parent.borrow(), vec![Some(json!({"memories": [1]}))]);
        assert!(sibling.borrow().is_empty());
    }

    #[test]
    fn test_descendant_notified_when_ancestor_replaced() {
        let store = PathStore::new();
        store.set("persona.emotion_system.emotions.joy", json!({"baseline": 60}));
        let joy = recorder(&store, "persona.emotion_system.emotions.joy");

        store.set("persona.emotion_system", json!({"emotions": {}}));

        assert_eq!(*joy.borrow(), vec![None]);
    }

    #[test]
    fn test_delivery_order() {
        let store = PathStore::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for path in ["a", "a.b.c.d", "a.b", "a.b.c"] {
            let sink = order.clone();
            let name = path.to_string();
            store.subscribe(path, move |_| {
                sink.borrow_mut().push(name.clone());
                Ok(())
            });
        }
        store.set("a.b.c", json!(1));
        assert_eq!(*order.borrow(), vec!["a.b.c", "a.b", "a", "a.b.c.d"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let store = PathStore::new();
        store.subscribe("k", |_| anyhow::bail!("boom"));
        let seen = recorder(&store, "k");
        store.set("k", json!(true));
        assert_eq!(*seen.borrow(), vec![Some(json!(true))]);
    }

    #[test]
    fn test_delete_notifies_with_none_and_ignores_absent() {
        let store = PathStore::new();
        store.set("a.b", json!(1));
        let seen = recorder(&store, "a.b");
        let parent = recorder(&store, "a");

        assert!(store.delete("a.b"));
        assert!(!store.delete("a.b"));

        assert_eq!(*seen.borrow(), vec![None]);
        assert_eq!(*parent.borrow(), vec![Some(json!({}))]);
    }

    #[test]
    fn test_reentrant_write_from_subscriber() {
        let store = Rc::new(PathStore::new());
        let inner = store.clone();
        store.subscribe("source", move |v| {
            if let Some(v) = v {
                inner.set("mirror", v.clone());
            }
            Ok(())
        });
        store.set("source", json!("hello"));
        assert_eq!(store.get("mirror"), Some(json!("hello")));
    }

    #[test]
    fn test_unsubscribe() {
        let store = PathStore::new();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        let id = store.subscribe("x", move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        store.set("x", json!(1));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set("x", json!(2));
        assert_eq!(seen.get(), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_merge_and_typed_access() {
        let store = PathStore::new();
        store.set("cfg", json!({"a": 1}));
        let mut patch = Map::new();
        patch.insert("b".into(), json!(2));
        store.merge("cfg", patch);
        assert_eq!(store.get("cfg"), Some(json!({"a": 1, "b": 2})));

        store.set_as("nums", &vec![1, 2, 3]).unwrap();
        let nums: Option<Vec<i32>> = store.get_as("nums").unwrap();
        assert_eq!(nums, Some(vec![1, 2, 3]));
        assert!(store.get_as::<Vec<i32>>("missing").unwrap().is_none());
        assert!(store.get_as::<Vec<i32>>("cfg").is_err());
    }

    #[test]
    fn test_reset_notifies_everyone() {
        let store = PathStore::new();
        store.set("a.b", json!(1));
        let seen = recorder(&store, "a.b");
        store.reset();
        assert_eq!(*seen.borrow(), vec![None]);
        assert_eq!(store.snapshot(), json!({}));
    }
}
