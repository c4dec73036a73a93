//! Self-healing pass for imported association lists: duplicate, malformed
//! and missing ids are regenerated in place, order preserved.

use serde_json::Value;

use crate::ids;

pub const ID_PREFIX: &str = "assoc";

/// One regenerated id. `old` is `None` when the record had no string id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdFix {
    pub index: usize,
    pub old: Option<String>,
    pub new: String,
}

/// Rewrite bad ids across `records`. Non-object entries are left alone.
/// A second run over the result changes nothing.
pub fn fix_association_ids(records: &mut [Value]) -> Vec<IdFix> {
    let positions: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_object())
        .map(|(i, _)| i)
        .collect();
    let mut slots: Vec<Option<String>> = positions
        .iter()
        .map(|&i| records[i].get("id").and_then(Value::as_str).map(String::from))
        .collect();
    let before = slots.clone();

    ids::heal_ids(&mut slots, ID_PREFIX);

    let mut fixes = Vec::new();
    for ((&index, old), new) in positions.iter().zip(before).zip(slots) {
        let Some(new) = new else { continue };
        if old.as_deref() == Some(new.as_str()) {
            continue;
        }
        if let Value::Object(map) = &mut records[index] {
            map.insert("id".into(), Value::String(new.clone()));
        }
        fixes.push(IdFix { index, old, new });
    }
    fixes
}
