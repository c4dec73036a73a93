//! ModuleRegistry: lifecycle coordinator.
//!
//! Modules are initialized and started in dependency order and stopped and
//! destroyed in reverse. Cycles are rejected at `register`, missing
//! dependencies at `initialize`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{PersonaError, Result};
use crate::events::PersonaEvent;
use crate::modules::{Module, ModuleContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Registered,
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Registered => "registered",
            ModuleState::Initialized => "initialized",
            ModuleState::Started => "started",
            ModuleState::Stopped => "stopped",
            ModuleState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub initialized: bool,
    pub started: bool,
}

struct Entry {
    module: Rc<dyn Module>,
    state: ModuleState,
}

pub struct ModuleRegistry {
    ctx: ModuleContext,
    entries: Vec<Entry>,
    initialized: bool,
    started: bool,
}

impl ModuleRegistry {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            entries: Vec::new(),
            initialized: false,
            started: false,
        }
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.module.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Module>> {
        self.index_of(name).map(|i| self.entries[i].module.clone())
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.index_of(name).map(|i| self.entries[i].state)
    }

    /// Registered module names, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.module.name()).collect()
    }

    fn emit(&self, event: PersonaEvent) {
        self.ctx.bus.emit(&event);
    }

    fn set_state(&mut self, index: usize, state: ModuleState) {
        let entry = &mut self.entries[index];
        debug!("Module '{}': {} -> {}", entry.module.name(), entry.state.as_str(), state.as_str());
        entry.state = state;
    }

    // ── Registration ──

    pub fn register(&mut self, module: Rc<dyn Module>) -> Result<()> {
        let name = module.name();
        if self.initialized {
            return Err(PersonaError::Configuration(format!(
                "Cannot register '{name}' after initialization; use load instead"
            )));
        }
        self.admit(module)
    }

    fn admit(&mut self, module: Rc<dyn Module>) -> Result<()> {
        let name = module.name();
        if self.index_of(name).is_some() {
            return Err(PersonaError::Configuration(format!(
                "Module '{name}' is already registered"
            )));
        }
        if let Some(cycle) = self.find_cycle(name, module.dependencies()) {
            return Err(PersonaError::Configuration(format!(
                "Circular dependency: {}",
                cycle.join(" -> ")
            )));
        }
        self.entries.push(Entry {
            module,
            state: ModuleState::Registered,
        });
        info!("Module registered: {}", name);
        self.emit(PersonaEvent::ModuleRegistered {
            name: name.to_string(),
        });
        Ok(())
    }

    /// The dependency path back to `name`, if adding it would close a loop.
    fn find_cycle(&self, name: &'static str, deps: &'static [&'static str]) -> Option<Vec<String>> {
        let mut graph: HashMap<&str, &[&str]> = self
            .entries
            .iter()
            .map(|e| (e.module.name(), e.module.dependencies()))
            .collect();
        graph.insert(name, deps);

        let mut seen = HashSet::new();
        for dep in deps {
            let mut path = vec![name.to_string()];
            if reaches(&graph, dep, name, &mut seen, &mut path) {
                return Some(path);
            }
        }
        None
    }

    /// Indices in dependency order; ties keep registration order.
    fn resolve_order(&self) -> Result<Vec<usize>> {
        for entry in &self.entries {
            for dep in entry.module.dependencies() {
                if self.index_of(dep).is_none() {
                    return Err(PersonaError::Configuration(format!(
                        "Module '{}' depends on missing module '{}'",
                        entry.module.name(),
                        dep
                    )));
                }
            }
        }

        let mut order: Vec<usize> = Vec::with_capacity(self.entries.len());
        let mut placed: HashSet<&str> = HashSet::new();
        while order.len() < self.entries.len() {
            let next = self.entries.iter().enumerate().find(|(i, e)| {
                !order.contains(i) && e.module.dependencies().iter().all(|d| placed.contains(d))
            });
            let Some((index, entry)) = next else {
                return Err(PersonaError::Configuration(
                    "Module dependencies cannot be ordered".into(),
                ));
            };
            placed.insert(entry.module.name());
            order.push(index);
        }
        Ok(order)
    }

    // ── Lifecycle ──

    pub fn initialize(&mut self) -> Result<()> {
        let order = self.resolve_order()?;
        for index in order {
            if self.entries[index].state != ModuleState::Registered {
                continue;
            }
            let module = self.entries[index].module.clone();
            module.initialize(&self.ctx)?;
            self.set_state(index, ModuleState::Initialized);
            info!("Module initialized: {}", module.name());
            self.emit(PersonaEvent::ModuleInitialized {
                name: module.name().to_string(),
            });
        }
        self.initialized = true;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(PersonaError::NotInitialized("registry"));
        }
        for index in self.resolve_order()? {
            if !matches!(
                self.entries[index].state,
                ModuleState::Initialized | ModuleState::Stopped
            ) {
                continue;
            }
            self.start_at(index)?;
        }
        self.started = true;
        Ok(())
    }

    fn start_at(&mut self, index: usize) -> Result<()> {
        let module = self.entries[index].module.clone();
        module.start()?;
        self.set_state(index, ModuleState::Started);
        info!("Module started: {}", module.name());
        self.emit(PersonaEvent::ModuleStarted {
            name: module.name().to_string(),
        });
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        let mut order = self.resolve_order()?;
        order.reverse();
        for index in order {
            if self.entries[index].state == ModuleState::Started {
                self.stop_at(index)?;
            }
        }
        self.started = false;
        Ok(())
    }

    fn stop_at(&mut self, index: usize) -> Result<()> {
        let module = self.entries[index].module.clone();
        module.stop()?;
        self.set_state(index, ModuleState::Stopped);
        info!("Module stopped: {}", module.name());
        self.emit(PersonaEvent::ModuleStopped {
            name: module.name().to_string(),
        });
        Ok(())
    }

    /// Stop anything still running, then destroy every module in reverse order.
    pub fn destroy(&mut self) -> Result<()> {
        let mut order = self.resolve_order()?;
        order.reverse();
        for index in order {
            self.destroy_at(index)?;
        }
        self.initialized = false;
        self.started = false;
        Ok(())
    }

    fn destroy_at(&mut self, index: usize) -> Result<()> {
        match self.entries[index].state {
            ModuleState::Destroyed | ModuleState::Registered => return Ok(()),
            ModuleState::Started => self.stop_at(index)?,
            _ => {}
        }
        let module = self.entries[index].module.clone();
        module.destroy()?;
        self.set_state(index, ModuleState::Destroyed);
        info!("Module destroyed: {}", module.name());
        self.emit(PersonaEvent::ModuleDestroyed {
            name: module.name().to_string(),
        });
        Ok(())
    }

    // ── Dynamic loading ──

    /// Add a module to a running registry, bringing it up to the
    /// registry's current phase.
    pub fn load(&mut self, module: Rc<dyn Module>) -> Result<()> {
        for dep in module.dependencies() {
            match self.state(dep) {
                None | Some(ModuleState::Destroyed) => {
                    return Err(PersonaError::Configuration(format!(
                        "Module '{}' depends on missing module '{}'",
                        module.name(),
                        dep
                    )))
                }
                _ => {}
            }
        }
        self.admit(module.clone())?;
        let index = self.entries.len() - 1;

        if self.initialized {
            module.initialize(&self.ctx)?;
            self.set_state(index, ModuleState::Initialized);
            self.emit(PersonaEvent::ModuleInitialized {
                name: module.name().to_string(),
            });
        }
        if self.started {
            self.start_at(index)?;
        }
        info!("Module loaded: {}", module.name());
        Ok(())
    }

    /// Tear down and remove a module nothing else depends on.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        let Some(index) = self.index_of(name) else {
            return Err(PersonaError::Configuration(format!("Unknown module '{name}'")));
        };
        let dependents: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| {
                e.state != ModuleState::Destroyed
                    && e.module.dependencies().iter().any(|d| *d == name)
            })
            .map(|e| e.module.name())
            .collect();
        if !dependents.is_empty() {
            return Err(PersonaError::Configuration(format!(
                "Cannot unload '{name}': required by {}",
                dependents.join(", ")
            )));
        }

        self.destroy_at(index)?;
        let entry = self.entries.remove(index);
        info!("Module unloaded: {}", name);
        self.emit(PersonaEvent::ModuleUnloaded {
            name: entry.module.name().to_string(),
        });
        Ok(())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut by_state = BTreeMap::new();
        for entry in &self.entries {
            *by_state.entry(entry.state.as_str().to_string()).or_insert(0) += 1;
        }
        RegistryStats {
            total: self.entries.len(),
            by_state,
            initialized: self.initialized,
            started: self.started,
        }
    }
}

fn reaches(
    graph: &HashMap<&str, &[&str]>,
    from: &str,
    target: &str,
    seen: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    path.push(from.to_string());
    if from == target {
        return true;
    }
    if seen.insert(from.to_string()) {
        if let Some(deps) = graph.get(from) {
            for dep in deps.iter() {
                if reaches(graph, dep, target, seen, path) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}
