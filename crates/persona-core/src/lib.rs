//! persona-core: Pure domain logic for the persona editor, no UI.
//!
//! A persona document lives in a path-addressed [`PathStore`]. Entity
//! modules (memories, emotions, cognitive abilities, associations) edit
//! their slice of it and talk to each other over the synchronous
//! [`EventBus`]; the association module keeps every cross-reference intact
//! when the things it points at are renamed or deleted. [`PersonaEditor`]
//! wires it all together with import/export and local persistence.

pub mod association;
pub mod config;
pub mod document;
pub mod editor;
pub mod error;
pub mod events;
pub mod ids;
pub mod modules;
pub mod persistence;
pub mod registry;
pub mod store;
pub mod types;

pub use association::{AssociationModule, AssociationSettings};
pub use config::EditorConfig;
pub use document::Format;
pub use editor::{ImportReport, PersonaEditor};
pub use error::{ErrorCode, FieldError, IntegrityWarning, PersonaError, Result, ValidationErrors};
pub use events::{EventBus, PersonaEvent};
pub use modules::{
    Cascadable, CognitiveModule, EmotionModule, EntityModule, MemoryModule, Module, ModuleContext,
};
pub use registry::{ModuleRegistry, ModuleState};
pub use store::PathStore;
