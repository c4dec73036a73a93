//! Command implementations. Each returns `Ok(false)` when the document was
//! processed but is not clean enough to call the run a success.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use persona_core::config::EditorConfig;
use persona_core::document;
use persona_core::types::EntityKind;
use persona_core::{EntityModule, ImportReport, PersonaEditor};

use crate::Command;

pub(crate) fn execute(command: Command, config: EditorConfig) -> Result<bool> {
    let editor = PersonaEditor::new(config).context("Failed to start the editor")?;
    let outcome = match command {
        Command::Validate { file } => validate(&editor, &file),
        Command::Convert { input, output } => convert(&editor, &input, &output),
        Command::Analyze { file } => analyze(&editor, &file),
        Command::New { output, sample } => create(&editor, &output, sample),
        Command::RenameMemory {
            file,
            old_id,
            new_id,
            output,
        } => rename_memory(&editor, &file, &old_id, &new_id, output.as_deref()),
        Command::RemoveMemory { file, id, output } => {
            remove_memory(&editor, &file, &id, output.as_deref())
        }
    };
    editor.shutdown()?;
    outcome
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn import(editor: &PersonaEditor, file: &Path) -> Result<ImportReport> {
    let report = editor
        .import_file(file)
        .with_context(|| format!("Failed to import {}", file.display()))?;
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    Ok(report)
}

fn validate(editor: &PersonaEditor, file: &Path) -> Result<bool> {
    let report = import(editor, file)?;
    let errors = editor.validate();
    print(&json!({
        "file": file.display().to_string(),
        "valid": errors.is_empty(),
        "fixed_ids": report.fixed_ids,
        "warnings": report.warnings,
        "errors": errors.errors,
    }))?;
    Ok(errors.is_empty())
}

fn convert(editor: &PersonaEditor, input: &Path, output: &Path) -> Result<bool> {
    import(editor, input)?;
    editor
        .export_file(output)
        .with_context(|| format!("Failed to export {}", output.display()))?;
    Ok(true)
}

fn analyze(editor: &PersonaEditor, file: &Path) -> Result<bool> {
    import(editor, file)?;
    let memory_stats = editor.memories().stats()?;
    print(&json!({
        "file": file.display().to_string(),
        "memories": memory_stats,
        "referenced_memories": editor.memories().referenced_memories()?,
        "associations": editor.associations().stats()?,
        "network": editor.associations().analyze_network()?,
        "cognitive": editor.cognitive().statistics()?,
    }))?;
    Ok(true)
}

fn create(editor: &PersonaEditor, output: &Path, sample: bool) -> Result<bool> {
    let template = if sample {
        document::sample_persona()
    } else {
        document::default_persona()
    };
    editor.load_document(template)?;
    editor
        .export_file(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("New persona written to {}", output.display());
    Ok(true)
}

fn rename_memory(
    editor: &PersonaEditor,
    file: &Path,
    old_id: &str,
    new_id: &str,
    output: Option<&Path>,
) -> Result<bool> {
    import(editor, file)?;
    let touched = editor
        .associations()
        .list()?
        .iter()
        .filter(|a| a.references_entity(EntityKind::Memory, old_id))
        .count();
    editor.memories().rename(old_id, new_id)?;
    editor.export_file(output.unwrap_or(file))?;
    print(&json!({"renamed": {"from": old_id, "to": new_id}, "associations_updated": touched}))?;
    Ok(true)
}

fn remove_memory(editor: &PersonaEditor, file: &Path, id: &str, output: Option<&Path>) -> Result<bool> {
    import(editor, file)?;
    let before = editor.associations().list()?.len();
    editor.memories().delete(id)?;
    let removed = before - editor.associations().list()?.len();
    editor.export_file(output.unwrap_or(file))?;
    print(&json!({"removed": id, "associations_removed": removed}))?;
    Ok(true)
}
