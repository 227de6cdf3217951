//! Workflow Parser
//!
//! Loads serialized graphs from YAML or JSON. The format follows the file
//! extension (`.json` is JSON, anything else YAML); since YAML is a
//! superset of JSON, strings of unknown origin go through the YAML parser.
//!
//! Parsing only produces a [`WorkflowDefinition`]; structural validation
//! happens when the definition is compiled into a [`Workflow`](super::Workflow).

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use crate::error::{EngineError, Result};

/// Serialization format of a workflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Yaml,
    Json,
}

impl WorkflowFormat {
    /// Picks the format from a file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => WorkflowFormat::Json,
            _ => WorkflowFormat::Yaml,
        }
    }
}

/// Parses a definition from a string.
pub fn parse_workflow(content: &str, format: WorkflowFormat) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = match format {
        WorkflowFormat::Json => serde_json::from_str(content).map_err(|e| {
            EngineError::Parse(format!("Failed to parse workflow JSON: {}", e))
        })?,
        WorkflowFormat::Yaml => serde_yaml::from_str(content).map_err(|e| {
            EngineError::Parse(format!(
                "Failed to parse workflow YAML: {}. Check the file format.",
                e
            ))
        })?,
    };

    debug!(
        "Parsed workflow '{}': {} blocks, {} edges",
        definition.id,
        definition.blocks.len(),
        definition.edges.len()
    );
    Ok(definition)
}

/// Loads a definition from a YAML or JSON file.
///
/// A definition without an `id` takes the file stem.
///
/// # Example
///
/// ```rust,no_run
/// use blockrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_workflow("flow.yaml")?;
///     println!("Loaded {} blocks", definition.blocks.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    let mut definition = parse_workflow(&content, WorkflowFormat::from_path(path))?;
    if definition.id.trim().is_empty() {
        definition.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    info!(
        "Loaded workflow '{}' ({} blocks, {} loops, {} parallels)",
        definition.id,
        definition.blocks.len(),
        definition.loops.len(),
        definition.parallels.len()
    );
    Ok(definition)
}

/// Saves a definition, choosing the format from the extension.
pub fn save_workflow(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let content = match WorkflowFormat::from_path(path) {
        WorkflowFormat::Json => serde_json::to_string_pretty(definition)
            .map_err(|e| EngineError::Parse(e.to_string()))?,
        WorkflowFormat::Yaml => {
            serde_yaml::to_string(definition).map_err(|e| EngineError::Parse(e.to_string()))?
        }
    };
    fs::write(path, content).map_err(|e| {
        EngineError::Parse(format!("Failed to write '{}': {}", path.display(), e))
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
