//! PersonaEditor: composition root.
//!
//! Owns the store, the bus, the four entity modules and the registry that
//! drives them, plus persistence and autosave. Everything else in the crate
//! receives its handles from here.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::association::{AssociationModule, AssociationSettings};
use crate::config::EditorConfig;
use crate::document::{self, Format};
use crate::error::{IntegrityWarning, PersonaError, Result, ValidationErrors};
use crate::events::{EventBus, PersonaEvent};
use crate::modules::{CognitiveModule, EmotionModule, MemoryModule, ModuleContext};
use crate::persistence::{AutoSaver, FileSnapshotStore, Persistence};
use crate::registry::ModuleRegistry;
use crate::store::{paths, PathStore};

/// Outcome of loading a document into the editor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    /// Version, shape and reference problems. The document was loaded anyway.
    pub warnings: Vec<IntegrityWarning>,
    /// Memory and association ids regenerated by the fix-up pass.
    pub fixed_ids: usize,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.fixed_ids == 0
    }
}

struct EditorInner {
    config: EditorConfig,
    store: Rc<PathStore>,
    bus: Rc<EventBus>,
    registry: RefCell<ModuleRegistry>,
    memories: MemoryModule,
    emotions: EmotionModule,
    cognitive: CognitiveModule,
    associations: AssociationModule,
    persistence: Persistence,
    dirty: Rc<Cell<bool>>,
    autosaver: RefCell<Option<AutoSaver>>,
}

impl EditorInner {
    fn persona(&self) -> Value {
        self.store.get(paths::PERSONA).unwrap_or(Value::Null)
    }

    fn save(&self) -> Result<String> {
        let saved_at = self.persistence.save(&self.persona())?;
        self.dirty.set(false);
        info!("Persona saved at {}", saved_at);
        self.bus.emit(&PersonaEvent::PersonaSaved {
            key: self.persistence.key().to_string(),
        });
        Ok(saved_at)
    }
}

#[derive(Clone)]
pub struct PersonaEditor {
    inner: Rc<EditorInner>,
}

impl PersonaEditor {
    /// Editor with the persistence backend `config` asks for.
    pub fn new(config: EditorConfig) -> Result<Self> {
        let persistence = if config.persistence {
            Persistence::new(
                Box::new(FileSnapshotStore::new(&config.storage_dir)),
                config.storage_key.clone(),
            )
        } else {
            Persistence::in_memory(config.storage_key.clone())
        };
        Self::with_persistence(config, persistence)
    }

    /// Editor over a caller-supplied persistence backend, started with the
    /// default persona loaded.
    pub fn with_persistence(config: EditorConfig, persistence: Persistence) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PersonaError::Configuration(e.to_string()))?;

        let store = Rc::new(PathStore::with_root(json!({
            "persona": document::default_persona(),
            "app": {}
        })));
        let bus = Rc::new(EventBus::new());
        let ctx = ModuleContext::new(store.clone(), bus.clone());

        let memories = MemoryModule::new();
        let emotions = EmotionModule::new();
        let cognitive = CognitiveModule::new();
        let associations = AssociationModule::new(AssociationSettings::from(&config));

        let mut registry = ModuleRegistry::new(ctx);
        registry.register(Rc::new(memories.clone()))?;
        registry.register(Rc::new(emotions.clone()))?;
        registry.register(Rc::new(cognitive.clone()))?;
        registry.register(Rc::new(associations.clone()))?;
        registry.initialize()?;
        registry.start()?;

        let dirty = Rc::new(Cell::new(false));
        let flag = dirty.clone();
        store.subscribe(paths::PERSONA, move |_| {
            flag.set(true);
            Ok(())
        });

        info!("Persona editor ready (storage key '{}')", persistence.key());
        Ok(Self {
            inner: Rc::new(EditorInner {
                config,
                store,
                bus,
                registry: RefCell::new(registry),
                memories,
                emotions,
                cognitive,
                associations,
                persistence,
                dirty,
                autosaver: RefCell::new(None),
            }),
        })
    }

    // ── Handles ──

    pub fn config(&self) -> &EditorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Rc<PathStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &Rc<EventBus> {
        &self.inner.bus
    }

    pub fn memories(&self) -> &MemoryModule {
        &self.inner.memories
    }

    pub fn emotions(&self) -> &EmotionModule {
        &self.inner.emotions
    }

    pub fn cognitive(&self) -> &CognitiveModule {
        &self.inner.cognitive
    }

    pub fn associations(&self) -> &AssociationModule {
        &self.inner.associations
    }

    pub fn registry(&self) -> std::cell::RefMut<'_, ModuleRegistry> {
        self.inner.registry.borrow_mut()
    }

    /// The persona subtree in editor form.
    pub fn persona(&self) -> Value {
        self.inner.persona()
    }

    /// Unsaved changes since the last save or load.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.get()
    }

    // ── Documents ──

    /// Replace the persona with `raw`, healing what can be healed and
    /// reporting the rest.
    pub fn load_document(&self, raw: Value) -> Result<ImportReport> {
        let (persona, mut warnings) = document::prepare_import(raw)?;

        let fixed = Rc::new(Cell::new(0));
        let counter = fixed.clone();
        let watcher = self.inner.bus.on("*:validation:completed", move |event| {
            if let PersonaEvent::MemoryIdsFixed { fixed } | PersonaEvent::AssociationIdsFixed { fixed } = event {
                counter.set(counter.get() + fixed);
            }
            Ok(())
        });

        self.inner.store.set(paths::PERSONA, persona);
        self.inner.bus.emit(&PersonaEvent::PersonaLoaded);
        self.inner.bus.off(watcher);

        let issues = document::validate_persona(&self.persona(), self.inner.config.max_conditions);
        for issue in &issues.errors {
            warn!("Import: {}", issue);
        }
        warnings.extend(issues.errors);
        self.inner.dirty.set(false);

        let report = ImportReport {
            warnings,
            fixed_ids: fixed.get(),
        };
        info!(
            "Persona loaded: {} warning(s), {} id(s) fixed",
            report.warnings.len(),
            report.fixed_ids
        );
        Ok(report)
    }

    pub fn import_str(&self, text: &str, format: Format) -> Result<ImportReport> {
        self.load_document(document::parse_document(text, format)?)
    }

    /// Import a `.json`/`.yaml`/`.yml` file; other extensions are sniffed.
    pub fn import_file(&self, path: &Path) -> Result<ImportReport> {
        let text = std::fs::read_to_string(path)?;
        let format = Format::from_path(path).unwrap_or_else(|| Format::detect(&text));
        self.import_str(&text, format)
    }

    /// Start over from the default template.
    pub fn new_document(&self) -> Result<ImportReport> {
        self.load_document(document::default_persona())
    }

    pub fn validate(&self) -> ValidationErrors {
        document::validate_persona(&self.persona(), self.inner.config.max_conditions)
    }

    /// The exported form of the current persona. Fails if it does not validate.
    pub fn export_document(&self) -> Result<Value> {
        let doc = document::prepare_export(&self.persona(), self.inner.config.max_conditions)?;
        self.inner.bus.emit(&PersonaEvent::PersonaExported);
        Ok(doc)
    }

    pub fn export_string(&self, format: Format) -> Result<String> {
        document::render_document(&self.export_document()?, format)
    }

    pub fn export_file(&self, path: &Path) -> Result<()> {
        let format = Format::from_path(path).unwrap_or(Format::Yaml);
        let text = self.export_string(format)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        info!("Persona exported to {}", path.display());
        Ok(())
    }

    // ── Persistence ──

    /// Write the snapshot. Returns the save timestamp.
    pub fn save(&self) -> Result<String> {
        self.inner.save()
    }

    /// Load the saved snapshot, if any.
    pub fn restore(&self) -> Result<Option<ImportReport>> {
        match self.inner.persistence.load()? {
            Some(persona) => self.load_document(persona).map(Some),
            None => Ok(None),
        }
    }

    pub fn last_saved(&self) -> Result<Option<String>> {
        self.inner.persistence.last_saved()
    }

    pub fn create_backup(&self) -> Result<bool> {
        self.inner.persistence.create_backup()
    }

    pub fn restore_backup(&self) -> Result<Option<ImportReport>> {
        match self.inner.persistence.backup()? {
            Some(persona) => self.load_document(persona).map(Some),
            None => Ok(None),
        }
    }

    pub fn clear_storage(&self) -> Result<()> {
        self.inner.persistence.clear()
    }

    /// Save every `autosave_interval_seconds` while there are unsaved
    /// changes. Must run inside a tokio `LocalSet`. No-op when autosave is off.
    pub fn start_autosave(&self) -> bool {
        if !self.inner.config.autosave {
            return false;
        }
        let weak: Weak<EditorInner> = Rc::downgrade(&self.inner);
        let period = Duration::from_secs(self.inner.config.autosave_interval_seconds);
        let saver = AutoSaver::spawn(period, move || {
            // The editor may be gone by the time the timer fires.
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if inner.dirty.get() {
                inner.save()?;
            }
            Ok(())
        });
        *self.inner.autosaver.borrow_mut() = Some(saver);
        true
    }

    pub fn stop_autosave(&self) {
        if let Some(mut saver) = self.inner.autosaver.borrow_mut().take() {
            saver.stop();
        }
    }

    /// Stop autosave and tear every module down.
    pub fn shutdown(&self) -> Result<()> {
        self.stop_autosave();
        let mut registry = self.inner.registry.borrow_mut();
        registry.stop()?;
        registry.destroy()?;
        info!("Persona editor shut down");
        Ok(())
    }
}
