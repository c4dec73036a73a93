//! Id format checks and deterministic "first unused `prefix_N`" generation.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;

pub const MAX_ID_LENGTH: usize = 50;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,50}$").expect("static id pattern"));

/// `[A-Za-z0-9_]{1,50}`
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id)
}

/// First `prefix_N` (N from 1) not present in `existing`.
pub fn first_unused<'a, I>(prefix: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: HashSet<&str> = existing.into_iter().collect();
    let mut counter: u64 = 1;
    loop {
        let candidate = format!("{}_{}", prefix, counter);
        if !taken.contains(candidate.as_str()) {
            return candidate;
        }
        counter += 1;
    }
}

/// Rewrite invalid or duplicate ids in place, keeping order.
///
/// Returns `(old, new)` for every rewritten slot; `old` is `None` when the
/// slot had no string id at all. Replacement ids never collide with any id
/// already present in the list, valid or not.
pub fn heal_ids(ids: &mut [Option<String>], prefix: &str) -> Vec<(Option<String>, String)> {
    let mut taken: HashSet<String> = ids.iter().flatten().cloned().collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut fixed = Vec::new();

    for slot in ids.iter_mut() {
        let needs_fix = match slot {
            Some(id) => !is_valid_id(id) || seen.contains(id.as_str()),
            None => true,
        };
        if needs_fix {
            let new_id = first_unused(prefix, taken.iter().map(String::as_str));
            taken.insert(new_id.clone());
            fixed.push((slot.clone(), new_id.clone()));
            *slot = Some(new_id);
        }
        if let Some(id) = slot {
            seen.insert(id.clone());
        }
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("memory_1"));
        assert!(is_valid_id("A"));
        assert!(is_valid_id(&"x".repeat(MAX_ID_LENGTH)));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("dash-id"));
        assert!(!is_valid_id(&"x".repeat(MAX_ID_LENGTH + 1)));
    }

    #[test]
    fn test_first_unused_skips_taken() {
        assert_eq!(first_unused("assoc", []), "assoc_1");
        assert_eq!(first_unused("assoc", ["assoc_1", "assoc_3"]), "assoc_2");
        assert_eq!(first_unused("memory", ["memory_1", "memory_2"]), "memory_3");
    }

    #[test]
    fn test_heal_ids_preserves_order_and_is_idempotent() {
        let mut ids = vec![
            Some("assoc_1".to_string()),
            Some("bad id".to_string()),
            Some("assoc_1".to_string()),
            None,
            Some("assoc_2".to_string()),
        ];
        let fixed = heal_ids(&mut ids, "assoc");
        assert_eq!(fixed.len(), 3);
        assert_eq!(
            ids,
            vec![
                Some("assoc_1".to_string()),
                Some("assoc_3".to_string()),
                Some("assoc_4".to_string()),
                Some("assoc_5".to_string()),
                Some("assoc_2".to_string()),
            ]
        );

        assert!(heal_ids(&mut ids, "assoc").is_empty());
    }
}
