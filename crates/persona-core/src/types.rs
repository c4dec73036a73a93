//! Core types: Memory, Emotion, CognitiveAbility, Association, Trigger, etc.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Entity kinds ──

/// What an id refers to. Used in errors, events and cascade lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Memory,
    Emotion,
    Ability,
    Association,
    Module,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Memory => write!(f, "memory"),
            EntityKind::Emotion => write!(f, "emotion"),
            EntityKind::Ability => write!(f, "ability"),
            EntityKind::Association => write!(f, "association"),
            EntityKind::Module => write!(f, "module"),
        }
    }
}

// ── Memory ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
    Autobiographical,
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Episodic,
        MemoryType::Semantic,
        MemoryType::Procedural,
        MemoryType::Autobiographical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
            MemoryType::Autobiographical => "autobiographical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_valence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    #[serde(default)]
    pub period: String,
    #[serde(default = "default_valence")]
    pub emotional_valence: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Fields this editor does not model (e.g. `associated_emotions`), kept for round-trips.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Emotion ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    pub baseline: i64,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Cognitive ability ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognitiveAbility {
    pub level: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Association ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AND" => Some(Operator::And),
            "OR" => Some(Operator::Or),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalCategory {
    Topics,
    Environment,
    Keywords,
}

impl ExternalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalCategory::Topics => "topics",
            ExternalCategory::Environment => "environment",
            ExternalCategory::Keywords => "keywords",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "topics" => Some(ExternalCategory::Topics),
            "environment" => Some(ExternalCategory::Environment),
            "keywords" => Some(ExternalCategory::Keywords),
            _ => None,
        }
    }
}

/// A simple condition. Also the shape of each entry of a complex trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    Memory {
        id: String,
    },
    Emotion {
        id: String,
        threshold: i64,
    },
    External {
        category: ExternalCategory,
        items: Vec<String>,
    },
}

impl Condition {
    pub fn type_name(&self) -> &'static str {
        match self {
            Condition::Memory { .. } => "memory",
            Condition::Emotion { .. } => "emotion",
            Condition::External { .. } => "external",
        }
    }

    /// The memory/emotion this condition points at, if any.
    pub fn reference(&self) -> Option<(EntityKind, &str)> {
        match self {
            Condition::Memory { id } => Some((EntityKind::Memory, id)),
            Condition::Emotion { id, .. } => Some((EntityKind::Emotion, id)),
            Condition::External { .. } => None,
        }
    }

    pub(crate) fn reference_mut(&mut self) -> Option<(EntityKind, &mut String)> {
        match self {
            Condition::Memory { id } => Some((EntityKind::Memory, id)),
            Condition::Emotion { id, .. } => Some((EntityKind::Emotion, id)),
            Condition::External { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    Memory {
        id: String,
    },
    Emotion {
        id: String,
        threshold: i64,
    },
    External {
        category: ExternalCategory,
        items: Vec<String>,
    },
    Complex {
        operator: Operator,
        conditions: Vec<Condition>,
    },
}

impl Trigger {
    pub const TYPE_NAMES: [&'static str; 4] = ["memory", "emotion", "external", "complex"];

    pub fn type_name(&self) -> &'static str {
        match self {
            Trigger::Memory { .. } => "memory",
            Trigger::Emotion { .. } => "emotion",
            Trigger::External { .. } => "external",
            Trigger::Complex { .. } => "complex",
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        match self {
            Trigger::Complex { conditions, .. } => conditions,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Memory,
    Emotion,
}

impl ResponseKind {
    pub const TYPE_NAMES: [&'static str; 2] = ["memory", "emotion"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Memory => "memory",
            ResponseKind::Emotion => "emotion",
        }
    }

    pub fn entity(&self) -> EntityKind {
        match self {
            ResponseKind::Memory => EntityKind::Memory,
            ResponseKind::Emotion => EntityKind::Emotion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub id: String,
    pub association_strength: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub id: String,
    pub trigger: Trigger,
    pub response: Response,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Association {
    /// Every memory/emotion id this association points at: trigger, each
    /// complex condition, then the response. Duplicates are kept.
    pub fn references(&self) -> Vec<(EntityKind, &str)> {
        let mut refs = Vec::new();
        match &self.trigger {
            Trigger::Memory { id } => refs.push((EntityKind::Memory, id.as_str())),
            Trigger::Emotion { id, .. } => refs.push((EntityKind::Emotion, id.as_str())),
            Trigger::External { .. } => {}
            Trigger::Complex { conditions, .. } => {
                refs.extend(conditions.iter().filter_map(|c| c.reference()));
            }
        }
        refs.push((self.response.kind.entity(), self.response.id.as_str()));
        refs
    }

    pub fn references_entity(&self, kind: EntityKind, id: &str) -> bool {
        self.references()
            .into_iter()
            .any(|(k, r)| k == kind && r == id)
    }
}
