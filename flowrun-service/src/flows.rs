//! Flow definition files

use anyhow::{Context, Result};
use flowrun_core::FlowDefinition;
use flowrun_engine::FlowEngine;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Register every `*.json` flow definition in `dir`. A file that fails to
/// parse or validate is skipped with a warning. Returns how many loaded.
pub fn load_dir(engine: &FlowEngine, dir: &Path) -> Result<usize> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading flow directory {}", dir.display()))?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
        .collect();
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        match load_file(&path).and_then(|flow| Ok(engine.register_flow(flow)?)) {
            Ok(()) => {
                debug!(path = %path.display(), "Loaded flow definition");
                loaded += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping flow definition"),
        }
    }
    Ok(loaded)
}

fn load_file(path: &Path) -> Result<FlowDefinition> {
    let content = fs::read_to_string(path)?;
    let flow = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(flow)
}
