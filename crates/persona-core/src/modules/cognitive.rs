//! CognitiveModule: ability levels under a cognitive model, plus the
//! read-side profile (statistics, strengths, weaknesses, balance).

use std::rc::Rc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::emotion::check_description;
use super::{
    as_object, decode, field, now, read_map, rounded_int, shallow_merge, EntityModule, Keyed,
    Module, ModuleContext, ModuleSlot,
};
use crate::error::{ErrorCode, PersonaError, Result, ValidationErrors};
use crate::events::PersonaEvent;
use crate::ids;
use crate::store::paths;
use crate::types::{CognitiveAbility, EntityKind};

pub const MODULE_NAME: &str = "cognitive";
pub const ID_PREFIX: &str = "ability";
pub const DEFAULT_LEVEL: i64 = 50;
pub const DEFAULT_CATEGORY: &str = "other";

pub const WAIS_ABILITIES: [&str; 4] = [
    "verbal_comprehension",
    "perceptual_reasoning",
    "working_memory",
    "processing_speed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CognitiveModel {
    WaisIv,
    Chc,
    Custom,
}

impl CognitiveModel {
    pub const ALL: [CognitiveModel; 3] = [
        CognitiveModel::WaisIv,
        CognitiveModel::Chc,
        CognitiveModel::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CognitiveModel::WaisIv => "WAIS-IV",
            CognitiveModel::Chc => "CHC",
            CognitiveModel::Custom => "Custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

pub fn wais_abilities() -> Map<String, Value> {
    let entries = [
        (
            "verbal_comprehension",
            75,
            "Understanding and expressing information through language, vocabulary and abstract reasoning.",
            "verbal",
        ),
        (
            "perceptual_reasoning",
            70,
            "Analysing visual information, spatial and pattern recognition.",
            "nonverbal",
        ),
        (
            "working_memory",
            65,
            "Holding and manipulating information briefly, attention and concentration.",
            "memory",
        ),
        (
            "processing_speed",
            80,
            "Processing simple visual information quickly and accurately.",
            "processing",
        ),
    ];
    entries
        .into_iter()
        .map(|(id, level, description, category)| {
            (
                id.to_string(),
                json!({ "level": level, "description": description, "category": category }),
            )
        })
        .collect()
}

/// Field checks for one ability entry.
pub fn validate_ability(record: &Map<String, Value>, prefix: &str) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    match record.get("level") {
        None | Some(Value::Null) => errors.push(
            field(prefix, "level"),
            ErrorCode::MissingLevel,
            "Ability level is required",
        ),
        Some(v) => match rounded_int(v) {
            Some(level) if (0..=100).contains(&level) => {}
            _ => errors.push(
                field(prefix, "level"),
                ErrorCode::InvalidLevel,
                "Level must be between 0 and 100",
            ),
        },
    }
    check_description(record, prefix, &mut errors);
    errors
}

// ── Profile ──

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AbilityStatistics {
    pub average: f64,
    pub min: i64,
    pub max: i64,
    pub range: i64,
    pub standard_deviation: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl BalanceRating {
    pub fn from_range(range: i64) -> Self {
        match range {
            r if r <= 20 => BalanceRating::Excellent,
            r if r <= 40 => BalanceRating::Good,
            r if r <= 60 => BalanceRating::Fair,
            _ => BalanceRating::Poor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    /// `100 - 2·σ`, floored at 0
    pub score: f64,
    pub rating: BalanceRating,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEntry {
    pub id: String,
    pub level: i64,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CognitiveProfile {
    pub model: String,
    pub statistics: AbilityStatistics,
    pub strengths: Vec<ProfileEntry>,
    pub weaknesses: Vec<ProfileEntry>,
    pub balance: Balance,
    pub generated_at: String,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn statistics(levels: &[i64]) -> AbilityStatistics {
    if levels.is_empty() {
        return AbilityStatistics {
            average: 0.0,
            min: 0,
            max: 0,
            range: 0,
            standard_deviation: 0.0,
            count: 0,
        };
    }
    let n = levels.len() as f64;
    let average = levels.iter().sum::<i64>() as f64 / n;
    let variance = levels
        .iter()
        .map(|&l| (l as f64 - average).powi(2))
        .sum::<f64>()
        / n;
    let min = levels.iter().copied().min().unwrap_or(0);
    let max = levels.iter().copied().max().unwrap_or(0);
    AbilityStatistics {
        average: round1(average),
        min,
        max,
        range: max - min,
        standard_deviation: round1(variance.sqrt()),
        count: levels.len(),
    }
}

struct CognitiveInner {
    slot: ModuleSlot,
}

#[derive(Clone)]
pub struct CognitiveModule {
    inner: Rc<CognitiveInner>,
}

impl Default for CognitiveModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CognitiveModule {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(CognitiveInner {
                slot: ModuleSlot::default(),
            }),
        }
    }

    fn abilities(&self) -> Result<Map<String, Value>> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        Ok(read_map(&attachment.store, paths::ABILITIES))
    }

    fn store_abilities(&self, abilities: Map<String, Value>) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        attachment.store.set(paths::ABILITIES, Value::Object(abilities));
        Ok(())
    }

    fn emit(&self, event: PersonaEvent) -> Result<()> {
        self.inner.slot.get(MODULE_NAME)?.emit(event);
        Ok(())
    }

    pub fn model(&self) -> Result<CognitiveModel> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        Ok(attachment
            .store
            .get(paths::COGNITIVE_MODEL)
            .and_then(|v| v.as_str().and_then(CognitiveModel::parse))
            .unwrap_or(CognitiveModel::WaisIv))
    }

    /// Switch models. Existing abilities are kept; WAIS-IV abilities that
    /// are missing are added at their defaults.
    pub fn switch_model(&self, model: &str) -> Result<CognitiveModel> {
        let model = CognitiveModel::parse(model).ok_or_else(|| {
            PersonaError::invalid(
                "model",
                ErrorCode::UnsupportedModel,
                format!("Unsupported cognitive model: {model}"),
            )
        })?;
        if model != CognitiveModel::WaisIv {
            info!("{} model has no ability set of its own, using WAIS-IV", model.as_str());
        }

        let mut abilities = self.abilities()?;
        for (id, default) in wais_abilities() {
            abilities.entry(id).or_insert(default);
        }
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        attachment
            .store
            .set(paths::COGNITIVE_MODEL, Value::String(model.as_str().into()));
        self.store_abilities(abilities)?;
        self.emit(PersonaEvent::CognitiveModelChanged {
            model: model.as_str().into(),
        })?;
        Ok(model)
    }

    /// Set a level, rounded and clamped to 0..=100. Returns the stored value.
    pub fn set_ability_level(&self, id: &str, level: f64) -> Result<i64> {
        let mut abilities = self.abilities()?;
        let entry = abilities
            .get_mut(id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Ability, id))?;
        let clamped = (level.round() as i64).clamp(0, 100);
        entry.insert("level".into(), json!(clamped));
        self.store_abilities(abilities)?;
        self.emit(PersonaEvent::AbilityUpdated { id: id.to_string() })?;
        Ok(clamped)
    }

    pub fn update_description(&self, id: &str, description: &str) -> Result<()> {
        self.update(id, &json!({ "description": description }))?;
        Ok(())
    }

    fn levels(&self) -> Result<Vec<(String, CognitiveAbility)>> {
        Ok(self.list()?.into_iter().map(|k| (k.id, k.value)).collect())
    }

    pub fn statistics(&self) -> Result<AbilityStatistics> {
        let levels: Vec<i64> = self.levels()?.iter().map(|(_, a)| a.level).collect();
        Ok(statistics(&levels))
    }

    /// Abilities at or above `max(75, average + 25)`, highest first.
    pub fn strengths(&self) -> Result<Vec<ProfileEntry>> {
        let stats = self.statistics()?;
        let threshold = (stats.average + 25.0).max(75.0);
        let mut found = self.entries_where(|level| level as f64 >= threshold)?;
        found.sort_by(|a, b| b.level.cmp(&a.level));
        Ok(found)
    }

    /// Abilities at or below `min(50, average - 25)`, lowest first.
    pub fn weaknesses(&self) -> Result<Vec<ProfileEntry>> {
        let stats = self.statistics()?;
        let threshold = (stats.average - 25.0).min(50.0);
        let mut found = self.entries_where(|level| level as f64 <= threshold)?;
        found.sort_by(|a, b| a.level.cmp(&b.level));
        Ok(found)
    }

    fn entries_where(&self, keep: impl Fn(i64) -> bool) -> Result<Vec<ProfileEntry>> {
        Ok(self
            .levels()?
            .into_iter()
            .filter(|(_, a)| keep(a.level))
            .map(|(id, a)| ProfileEntry {
                id,
                level: a.level,
                description: a.description,
                category: a.category,
            })
            .collect())
    }

    pub fn profile(&self) -> Result<CognitiveProfile> {
        let statistics = self.statistics()?;
        Ok(CognitiveProfile {
            model: self.model()?.as_str().to_string(),
            strengths: self.strengths()?,
            weaknesses: self.weaknesses()?,
            balance: Balance {
                score: (100.0 - statistics.standard_deviation * 2.0).max(0.0),
                rating: BalanceRating::from_range(statistics.range),
            },
            statistics,
            generated_at: now(),
        })
    }

    fn ensure_system(&self) -> Result<()> {
        let attachment = self.inner.slot.get(MODULE_NAME)?;
        let store = &attachment.store;
        let model_ok = store
            .get(paths::COGNITIVE_MODEL)
            .and_then(|v| v.as_str().and_then(CognitiveModel::parse))
            .is_some();
        if !model_ok {
            if store.contains(paths::COGNITIVE_MODEL) {
                warn!("Unsupported cognitive model, using WAIS-IV");
            }
            store.set(paths::COGNITIVE_MODEL, json!(CognitiveModel::WaisIv.as_str()));
        }
        if !matches!(store.get(paths::ABILITIES), Some(Value::Object(_))) {
            store.set(paths::ABILITIES, Value::Object(wais_abilities()));
        }
        Ok(())
    }
}

impl EntityModule for CognitiveModule {
    type Record = Keyed<CognitiveAbility>;

    fn kind(&self) -> EntityKind {
        EntityKind::Ability
    }

    fn create(&self, draft: &Value) -> Result<String> {
        let draft = as_object(draft, "ability")?;
        let mut abilities = self.abilities()?;

        let mut record = draft.clone();
        let requested = record.remove("id");
        record.entry("level").or_insert_with(|| json!(DEFAULT_LEVEL));
        record.entry("description").or_insert_with(|| json!(""));
        record.entry("category").or_insert_with(|| json!(DEFAULT_CATEGORY));

        let mut errors = validate_ability(&record, "");
        let id = match requested {
            None | Some(Value::Null) => {
                ids::first_unused(ID_PREFIX, abilities.keys().map(String::as_str))
            }
            Some(Value::String(id)) if !ids::is_valid_id(&id) => {
                errors.push("id", ErrorCode::InvalidIdFormat, format!("Invalid ID format: {id}"));
                id
            }
            Some(Value::String(id)) => {
                if abilities.contains_key(&id) {
                    errors.push("id", ErrorCode::DuplicateId, format!("Duplicate ID: {id}"));
                }
                id
            }
            Some(other) => {
                errors.push("id", ErrorCode::InvalidIdFormat, format!("Invalid ID format: {other}"));
                String::new()
            }
        };
        errors.into_result()?;

        if let Some(level) = record.get("level").and_then(rounded_int) {
            record.insert("level".into(), json!(level));
        }
        let ability: CognitiveAbility = decode(Value::Object(record), "ability")?;
        abilities.insert(id.clone(), serde_json::to_value(&ability)?);
        self.store_abilities(abilities)?;
        info!(id = %id, level = ability.level, "Ability added");
        self.emit(PersonaEvent::AbilityAdded { id: id.clone() })?;
        Ok(id)
    }

    fn read(&self, id: &str) -> Result<Keyed<CognitiveAbility>> {
        let value = self
            .abilities()?
            .remove(id)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Ability, id))?;
        Ok(Keyed {
            id: id.to_string(),
            value: decode(value, "ability")?,
        })
    }

    /// Abilities are not referenced by other entities, so `id` in a patch is ignored.
    fn update(&self, id: &str, patch: &Value) -> Result<Keyed<CognitiveAbility>> {
        let patch = as_object(patch, "patch")?;
        let mut abilities = self.abilities()?;
        let current = abilities
            .get(id)
            .ok_or_else(|| PersonaError::not_found(EntityKind::Ability, id))?;
        let mut merged = shallow_merge(as_object(current, "ability")?, patch);
        merged.remove("id");
        merged.insert("updated_at".into(), Value::String(now()));

        validate_ability(&merged, "").into_result()?;
        if let Some(level) = merged.get("level").and_then(rounded_int) {
            merged.insert("level".into(), json!(level));
        }
        let ability: CognitiveAbility = decode(Value::Object(merged), "ability")?;
        abilities.insert(id.to_string(), serde_json::to_value(&ability)?);
        self.store_abilities(abilities)?;
        self.emit(PersonaEvent::AbilityUpdated { id: id.to_string() })?;
        Ok(Keyed {
            id: id.to_string(),
            value: ability,
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut abilities = self.abilities()?;
        if abilities.remove(id).is_none() {
            return Err(PersonaError::not_found(EntityKind::Ability, id));
        }
        self.store_abilities(abilities)?;
        info!(id, "Ability removed");
        self.emit(PersonaEvent::AbilityRemoved { id: id.to_string() })?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Keyed<CognitiveAbility>>> {
        Ok(self
            .abilities()?
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value::<CognitiveAbility>(value) {
                Ok(value) => Some(Keyed { id, value }),
                Err(e) => {
                    warn!("Skipping malformed ability '{}': {}", id, e);
                    None
                }
            })
            .collect())
    }
}

impl Module for CognitiveModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn initialize(&self, ctx: &ModuleContext) -> Result<()> {
        self.inner.slot.attach(ctx);
        self.ensure_system()?;

        let weak = Rc::downgrade(&self.inner);
        self.inner.slot.listen(&ctx.bus, "persona:loaded", move |_| {
            if let Some(inner) = weak.upgrade() {
                CognitiveModule { inner }.ensure_system()?;
            }
            Ok(())
        });
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
    use crate::store::PathStore;

    fn setup() -> CognitiveModule {
        let ctx = ModuleContext::new(Rc::new(PathStore::new()), Rc::new(EventBus::new()));
        let module = CognitiveModule::new();
        module.initialize(&ctx).unwrap();
        module
    }

    #[test]
    fn test_defaults_and_statistics() {
        let module = setup();
        assert_eq!(module.model().unwrap(), CognitiveModel::WaisIv);
        let stats = module.statistics().unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.average, 72.5);
        assert_eq!(stats.min, 65);
        assert_eq!(stats.max, 80);
        assert_eq!(stats.range, 15);
        assert_eq!(stats.standard_deviation, 5.6);
    }

    #[test]
    fn test_empty_statistics() {
        assert_eq!(statistics(&[]).count, 0);
        assert_eq!(statistics(&[]).average, 0.0);
    }

    #[test]
    fn test_level_setter_rounds_and_clamps() {
        let module = setup();
        assert_eq!(module.set_ability_level("working_memory", 64.5).unwrap(), 65);
        assert_eq!(module.set_ability_level("working_memory", 250.0).unwrap(), 100);
        assert!(module.set_ability_level("telepathy", 10.0).is_err());
    }

    #[test]
    fn test_update_rejects_out_of_range_level() {
        let module = setup();
        let err = module
            .update("processing_speed", &json!({"level": 101}))
            .unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::InvalidLevel));
        assert_eq!(module.read("processing_speed").unwrap().value.level, 80);

        let long = "d".repeat(501);
        assert!(module.update_description("processing_speed", &long).is_err());
    }

    #[test]
    fn test_strengths_weaknesses_and_balance() {
        let module = setup();
        module.set_ability_level("verbal_comprehension", 95.0).unwrap();
        module.set_ability_level("working_memory", 30.0).unwrap();

        let profile = module.profile().unwrap();
        let strengths: Vec<&str> = profile.strengths.iter().map(|s| s.id.as_str()).collect();
        let weaknesses: Vec<&str> = profile.weaknesses.iter().map(|s| s.id.as_str()).collect();
        // average 68.8 -> strength threshold 93.8, weakness threshold 43.8
        assert_eq!(strengths, vec!["verbal_comprehension"]);
        assert_eq!(weaknesses, vec!["working_memory"]);
        assert_eq!(profile.balance.rating, BalanceRating::Poor);
        assert_eq!(BalanceRating::from_range(40), BalanceRating::Good);
    }

    #[test]
    fn test_create_and_delete() {
        let module = setup();
        let id = module.create(&json!({"level": 55, "category": "memory"})).unwrap();
        assert_eq!(id, "ability_1");
        assert_eq!(module.read(&id).unwrap().value.category, "memory");
        module.delete(&id).unwrap();
        assert!(matches!(
            module.read(&id),
            Err(PersonaError::NotFound { kind: EntityKind::Ability, .. })
        ));
    }

    #[test]
    fn test_switch_model_keeps_abilities() {
        let module = setup();
        module.create(&json!({"id": "fluid_reasoning", "level": 60})).unwrap();
        module.switch_model("CHC").unwrap();
        assert_eq!(module.model().unwrap(), CognitiveModel::Chc);
        assert!(module.exists("fluid_reasoning"));
        assert!(module.switch_model("Stanford-Binet").is_err());
    }
}
