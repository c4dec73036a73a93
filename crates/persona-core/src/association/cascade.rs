//! Cascade logic as pure functions over association lists.
//!
//! The module applies these against the store; [`apply`] folds a single
//! event into a list directly.

use crate::events::PersonaEvent;
use crate::types::{Association, EntityKind, Trigger};

/// A copy of `association` with every `kind` reference to `old_id` rewritten
/// to `new_id`, or `None` if it had none.
pub fn rename_in(association: &Association, kind: EntityKind, old_id: &str, new_id: &str) -> Option<Association> {
    if old_id == new_id || !association.references_entity(kind, old_id) {
        return None;
    }
    let mut updated = association.clone();

    let rewrite = |id: &mut String| {
        if id == old_id {
            *id = new_id.to_string();
        }
    };
    match &mut updated.trigger {
        Trigger::Memory { id } if kind == EntityKind::Memory => rewrite(id),
        Trigger::Emotion { id, .. } if kind == EntityKind::Emotion => rewrite(id),
        Trigger::Complex { conditions, .. } => {
            for condition in conditions.iter_mut() {
                if let Some((k, id)) = condition.reference_mut() {
                    if k == kind {
                        rewrite(id);
                    }
                }
            }
        }
        _ => {}
    }
    if updated.response.kind.entity() == kind {
        rewrite(&mut updated.response.id);
    }
    Some(updated)
}

/// Rewritten copies of every association that referenced `old_id`, in collection order.
pub fn plan_rename(associations: &[Association], kind: EntityKind, old_id: &str, new_id: &str) -> Vec<Association> {
    associations
        .iter()
        .filter_map(|a| rename_in(a, kind, old_id, new_id))
        .collect()
}

/// Ids of every association whose trigger, condition or response references `id`.
pub fn collect_dependents(associations: &[Association], kind: EntityKind, id: &str) -> Vec<String> {
    associations
        .iter()
        .filter(|a| a.references_entity(kind, id))
        .map(|a| a.id.clone())
        .collect()
}

/// Fold one event into an association list: renames rewrite references,
/// removals drop dependents. Other events leave the list as is.
pub fn apply(associations: Vec<Association>, event: &PersonaEvent) -> Vec<Association> {
    match event {
        PersonaEvent::MemoryIdChanged { old_id, new_id } => {
            rename_all(associations, EntityKind::Memory, old_id, new_id)
        }
        PersonaEvent::EmotionIdChanged { old_id, new_id } => {
            rename_all(associations, EntityKind::Emotion, old_id, new_id)
        }
        PersonaEvent::MemoryBeforeRemove { id } => drop_dependents(associations, EntityKind::Memory, id),
        PersonaEvent::EmotionBeforeRemove { id } => drop_dependents(associations, EntityKind::Emotion, id),
        _ => associations,
    }
}

fn rename_all(associations: Vec<Association>, kind: EntityKind, old_id: &str, new_id: &str) -> Vec<Association> {
    associations
        .into_iter()
        .map(|a| rename_in(&a, kind, old_id, new_id).unwrap_or(a))
        .collect()
}

fn drop_dependents(associations: Vec<Association>, kind: EntityKind, id: &str) -> Vec<Association> {
    associations
        .into_iter()
        .filter(|a| !a.references_entity(kind, id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Condition, ExternalCategory, Operator, Response, ResponseKind};
    use serde_json::Map;

    fn assoc(id: &str, trigger: Trigger, kind: ResponseKind, target: &str) -> Association {
        Association {
            id: id.into(),
            trigger,
            response: Response {
                kind,
                id: target.into(),
                association_strength: 50,
            },
            metadata: Map::new(),
            created_at: None,
            updated_at: None,
        }
    }

    fn sample() -> Vec<Association> {
        vec![
            assoc(
                "a1",
                Trigger::Memory { id: "m1".into() },
                ResponseKind::Emotion,
                "joy",
            ),
            assoc(
                "a2",
                Trigger::Complex {
                    operator: Operator::Or,
                    conditions: vec![
                        Condition::External {
                            category: ExternalCategory::Topics,
                            items: vec!["m1".into()],
                        },
                        Condition::Memory { id: "m1".into() },
                        Condition::Emotion {
                            id: "fear".into(),
                            threshold: 30,
                        },
                    ],
                },
                ResponseKind::Memory,
                "m2",
            ),
            assoc(
                "a3",
                Trigger::Emotion {
                    id: "joy".into(),
                    threshold: 60,
                },
                ResponseKind::Memory,
                "m1",
            ),
            assoc(
                "a4",
                Trigger::External {
                    category: ExternalCategory::Keywords,
                    items: vec!["rain".into()],
                },
                ResponseKind::Emotion,
                "fear",
            ),
        ]
    }

    #[test]
    fn test_rename_reaches_trigger_conditions_and_response() {
        let renamed = plan_rename(&sample(), EntityKind::Memory, "m1", "m9");
        let ids: Vec<&str> = renamed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);

        for a in &renamed {
            assert!(!a.references_entity(EntityKind::Memory, "m1"));
            assert!(a.references_entity(EntityKind::Memory, "m9"));
        }
        // External items are free text, not references.
        assert_eq!(
            renamed[1].trigger.conditions()[0],
            Condition::External {
                category: ExternalCategory::Topics,
                items: vec!["m1".into()]
            }
        );
    }

    #[test]
    fn test_rename_is_kind_scoped() {
        let mut list = sample();
        list.push(assoc(
            "a5",
            Trigger::Emotion {
                id: "m1".into(),
                threshold: 10,
            },
            ResponseKind::Emotion,
            "m1",
        ));
        let renamed = plan_rename(&list, EntityKind::Emotion, "m1", "calm");
        assert_eq!(renamed.len(), 1);
        assert_eq!(renamed[0].response.id, "calm");
        assert!(plan_rename(&list, EntityKind::Memory, "m1", "m1").is_empty());
    }

    #[test]
    fn test_collect_dependents_includes_conditions() {
        let list = sample();
        assert_eq!(
            collect_dependents(&list, EntityKind::Memory, "m1"),
            vec!["a1", "a2", "a3"]
        );
        assert_eq!(
            collect_dependents(&list, EntityKind::Emotion, "fear"),
            vec!["a2", "a4"]
        );
        assert!(collect_dependents(&list, EntityKind::Memory, "nope").is_empty());
    }

    #[test]
    fn test_apply_events() {
        let renamed = apply(
            sample(),
            &PersonaEvent::MemoryIdChanged {
                old_id: "m1".into(),
                new_id: "m2".into(),
            },
        );
        assert_eq!(renamed.len(), 4);
        assert!(collect_dependents(&renamed, EntityKind::Memory, "m1").is_empty());

        let pruned = apply(renamed, &PersonaEvent::MemoryBeforeRemove { id: "m2".into() });
        let ids: Vec<&str> = pruned.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a4"]);

        let untouched = apply(pruned.clone(), &PersonaEvent::PersonaLoaded);
        assert_eq!(untouched, pruned);
    }
}
