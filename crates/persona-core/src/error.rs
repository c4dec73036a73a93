//! Error taxonomy: validation, not-found, configuration, store and I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EntityKind;

/// Machine-readable code attached to every field-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ── ids ──
    MissingId,
    InvalidIdFormat,
    DuplicateId,

    // ── memories ──
    MissingType,
    UnsupportedType,
    MissingContent,
    ContentTooLong,
    InvalidValence,

    // ── emotions / abilities ──
    InvalidBaseline,
    MissingLevel,
    InvalidLevel,
    DescriptionTooLong,
    UnsupportedModel,
    MissingEmotion,
    MissingAbility,
    MissingTrait,
    InvalidTrait,

    // ── associations ──
    MissingTrigger,
    MissingResponse,
    UnsupportedTriggerType,
    UnsupportedResponseType,
    UnsupportedCategory,
    UnsupportedOperator,
    InvalidThreshold,
    InvalidAssociationStrength,
    EmptyExternalItems,
    EmptyConditions,
    NestedComplexCondition,
    NotComplexTrigger,
    NotExternalTrigger,
    MaxConditionsReached,
    LastCondition,
    InvalidConditionIndex,
    UnknownMemoryReference,
    UnknownEmotionReference,

    // ── documents ──
    MissingSection,
    InvalidShape,
    VersionMismatch,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingId => "MISSING_ID",
            ErrorCode::InvalidIdFormat => "INVALID_ID_FORMAT",
            ErrorCode::DuplicateId => "DUPLICATE_ID",
            ErrorCode::MissingType => "MISSING_TYPE",
            ErrorCode::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorCode::MissingContent => "MISSING_CONTENT",
            ErrorCode::ContentTooLong => "CONTENT_TOO_LONG",
            ErrorCode::InvalidValence => "INVALID_VALENCE",
            ErrorCode::InvalidBaseline => "INVALID_BASELINE",
            ErrorCode::MissingLevel => "MISSING_LEVEL",
            ErrorCode::InvalidLevel => "INVALID_LEVEL",
            ErrorCode::DescriptionTooLong => "DESCRIPTION_TOO_LONG",
            ErrorCode::UnsupportedModel => "UNSUPPORTED_MODEL",
            ErrorCode::MissingEmotion => "MISSING_EMOTION",
            ErrorCode::MissingAbility => "MISSING_ABILITY",
            ErrorCode::MissingTrait => "MISSING_TRAIT",
            ErrorCode::InvalidTrait => "INVALID_TRAIT",
            ErrorCode::MissingTrigger => "MISSING_TRIGGER",
            ErrorCode::MissingResponse => "MISSING_RESPONSE",
            ErrorCode::UnsupportedTriggerType => "UNSUPPORTED_TRIGGER_TYPE",
            ErrorCode::UnsupportedResponseType => "UNSUPPORTED_RESPONSE_TYPE",
            ErrorCode::UnsupportedCategory => "UNSUPPORTED_CATEGORY",
            ErrorCode::UnsupportedOperator => "UNSUPPORTED_OPERATOR",
            ErrorCode::InvalidThreshold => "INVALID_THRESHOLD",
            ErrorCode::InvalidAssociationStrength => "INVALID_ASSOCIATION_STRENGTH",
            ErrorCode::EmptyExternalItems => "EMPTY_EXTERNAL_ITEMS",
            ErrorCode::EmptyConditions => "EMPTY_CONDITIONS",
            ErrorCode::NestedComplexCondition => "NESTED_COMPLEX_CONDITION",
            ErrorCode::NotComplexTrigger => "NOT_COMPLEX_TRIGGER",
            ErrorCode::NotExternalTrigger => "NOT_EXTERNAL_TRIGGER",
            ErrorCode::MaxConditionsReached => "MAX_CONDITIONS_REACHED",
            ErrorCode::LastCondition => "LAST_CONDITION",
            ErrorCode::InvalidConditionIndex => "INVALID_CONDITION_INDEX",
            ErrorCode::UnknownMemoryReference => "UNKNOWN_MEMORY_REFERENCE",
            ErrorCode::UnknownEmotionReference => "UNKNOWN_EMOTION_REFERENCE",
            ErrorCode::MissingSection => "MISSING_SECTION",
            ErrorCode::InvalidShape => "INVALID_SHAPE",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
        }
    }

    /// Codes describing a dangling memory/emotion reference.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownMemoryReference | ErrorCode::UnknownEmotionReference
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violated field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.code, self.message)
    }
}

/// Referential-integrity problems found on import. Non-fatal.
pub type IntegrityWarning = FieldError;

/// Every violation found in one validation pass, reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, code: ErrorCode, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, code, message));
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.errors.iter().map(|e| e.code).collect()
    }

    /// `Ok(())` when nothing was collected, otherwise the itemized error.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(PersonaError::Validation(self))
        }
    }
}

impl From<FieldError> for ValidationErrors {
    fn from(err: FieldError) -> Self {
        Self { errors: vec![err] }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        f.write_str(&items.join("; "))
    }
}

/// Typed read/write failures at a store path.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to decode value at '{path}': {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode value for '{path}': {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error for every editor operation.
#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Module '{0}' is not initialized")]
    NotInitialized(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PersonaError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        PersonaError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        PersonaError::Validation(FieldError::new(field, code, message).into())
    }

    /// The itemized violations, if this is a validation failure.
    pub fn validation(&self) -> Option<&ValidationErrors> {
        match self {
            PersonaError::Validation(v) => Some(v),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersonaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::InvalidAssociationStrength).unwrap();
        assert_eq!(json, "\"INVALID_ASSOCIATION_STRENGTH\"");
        assert_eq!(
            ErrorCode::InvalidAssociationStrength.as_str(),
            "INVALID_ASSOCIATION_STRENGTH"
        );
    }

    #[test]
    fn test_validation_errors_display_lists_every_field() {
        let mut errors = ValidationErrors::new();
        errors.push("trigger", ErrorCode::MissingTrigger, "Trigger is required");
        errors.push("response", ErrorCode::MissingResponse, "Response is required");

        let text = PersonaError::Validation(errors).to_string();
        assert!(text.contains("trigger [MISSING_TRIGGER]"));
        assert!(text.contains("response [MISSING_RESPONSE]"));
    }

    #[test]
    fn test_into_result() {
        assert!(ValidationErrors::new().into_result().is_ok());

        let mut errors = ValidationErrors::new();
        errors.push("id", ErrorCode::DuplicateId, "Duplicate ID: a");
        let err = errors.into_result().unwrap_err();
        assert!(err.validation().unwrap().has_code(ErrorCode::DuplicateId));
    }

    #[test]
    fn test_not_found_message_contains_id() {
        let err = PersonaError::not_found(EntityKind::Memory, "m42");
        assert_eq!(err.to_string(), "memory not found: m42");
    }
}
