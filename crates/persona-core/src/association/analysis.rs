//! Read-side aggregation over the association network.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{Association, EntityKind, ResponseKind, Trigger};

pub const HIGH_STRENGTH: i64 = 70;
pub const MEDIUM_STRENGTH: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrengthDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl StrengthDistribution {
    fn record(&mut self, strength: i64) {
        if strength >= HIGH_STRENGTH {
            self.high += 1;
        } else if strength >= MEDIUM_STRENGTH {
            self.medium += 1;
        } else {
            self.low += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkAnalysis {
    pub total_associations: usize,
    pub trigger_types: BTreeMap<String, usize>,
    pub response_types: BTreeMap<String, usize>,
    pub strength_distribution: StrengthDistribution,
    /// Associations touching each memory, conditions included. Every known memory is listed.
    pub memory_connections: BTreeMap<String, usize>,
    pub emotion_connections: BTreeMap<String, usize>,
    /// Complex condition count plus external trigger item count.
    pub complexity_score: usize,
}

/// Aggregate `associations`. `memory_ids` and `emotion_ids` seed the
/// connection tables so unconnected entities show up with 0.
pub fn analyze_network<'a>(
    associations: &[Association],
    memory_ids: impl IntoIterator<Item = &'a str>,
    emotion_ids: impl IntoIterator<Item = &'a str>,
) -> NetworkAnalysis {
    let mut trigger_types: BTreeMap<String, usize> =
        Trigger::TYPE_NAMES.iter().map(|t| (t.to_string(), 0)).collect();
    let mut response_types: BTreeMap<String, usize> =
        ResponseKind::TYPE_NAMES.iter().map(|t| (t.to_string(), 0)).collect();
    let mut memory_connections: BTreeMap<String, usize> =
        memory_ids.into_iter().map(|id| (id.to_string(), 0)).collect();
    let mut emotion_connections: BTreeMap<String, usize> =
        emotion_ids.into_iter().map(|id| (id.to_string(), 0)).collect();
    let mut strength_distribution = StrengthDistribution::default();
    let mut complexity_score = 0;

    for association in associations {
        *trigger_types.entry(association.trigger.type_name().into()).or_default() += 1;
        *response_types.entry(association.response.kind.as_str().into()).or_default() += 1;
        strength_distribution.record(association.response.association_strength);

        // An association counts once per entity, however many times it names it.
        let touched: BTreeSet<(EntityKind, &str)> = association.references().into_iter().collect();
        for (kind, id) in touched {
            let table = match kind {
                EntityKind::Memory => &mut memory_connections,
                EntityKind::Emotion => &mut emotion_connections,
                _ => continue,
            };
            *table.entry(id.to_string()).or_default() += 1;
        }

        complexity_score += match &association.trigger {
            Trigger::Complex { conditions, .. } => conditions.len(),
            Trigger::External { items, .. } => items.len(),
            _ => 0,
        };
    }

    NetworkAnalysis {
        total_associations: associations.len(),
        trigger_types,
        response_types,
        strength_distribution,
        memory_connections,
        emotion_connections,
        complexity_score,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationStats {
    pub total: usize,
    pub by_trigger_type: BTreeMap<String, usize>,
    pub by_response_type: BTreeMap<String, usize>,
    pub average_strength: f64,
}

pub fn stats(associations: &[Association]) -> AssociationStats {
    let analysis = analyze_network(associations, std::iter::empty(), std::iter::empty());
    let average_strength = if associations.is_empty() {
        0.0
    } else {
        let sum: i64 = associations
            .iter()
            .map(|a| a.response.association_strength)
            .sum();
        (sum as f64 / associations.len() as f64 * 10.0).round() / 10.0
    };
    AssociationStats {
        total: analysis.total_associations,
        by_trigger_type: analysis.trigger_types,
        by_response_type: analysis.response_types,
        average_strength,
    }
}

/// Associations whose trigger (or any complex condition) references `id`.
pub fn find_by_trigger<'a>(associations: &'a [Association], kind: EntityKind, id: &str) -> Vec<&'a Association> {
    associations
        .iter()
        .filter(|a| match &a.trigger {
            Trigger::Memory { id: t } => kind == EntityKind::Memory && t == id,
            Trigger::Emotion { id: t, .. } => kind == EntityKind::Emotion && t == id,
            Trigger::Complex { conditions, .. } => conditions
                .iter()
                .filter_map(|c| c.reference())
                .any(|(k, r)| k == kind && r == id),
            Trigger::External { .. } => false,
        })
        .collect()
}

pub fn find_by_response<'a>(associations: &'a [Association], kind: ResponseKind, id: &str) -> Vec<&'a Association> {
    associations
        .iter()
        .filter(|a| a.response.kind == kind && a.response.id == id)
        .collect()
}
