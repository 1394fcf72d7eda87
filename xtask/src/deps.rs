// Licensed under the Apache-2.0 license

use crate::PROJECT_ROOT;
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use toml::{Table, Value};

const IGNORE_DIRS: [&str; 3] = [".git", "examples", "target"];
const DEP_TABLES: [&str; 3] = ["dependencies", "dev-dependencies", "build-dependencies"];

pub(crate) fn check() -> Result<()> {
    let cargo_tomls = find_cargo_tomls(&PROJECT_ROOT)?;
    let mut okay = true;
    for toml_path in cargo_tomls.iter() {
        let data = std::fs::read_to_string(toml_path)?;
        let value = data.parse::<Table>()?;
        let bad = non_workspace_deps(&value);
        if DEP_TABLES.iter().any(|t| value.contains_key(*t)) {
            println!("Checking dependencies in {}", toml_path.display());
        }
        for (k, v) in bad {
            okay = false;
            println!(
                "  dependency {} should be {}.workspace = true but was {} = {}",
                k, k, k, v
            );
        }
    }
    if !okay {
        bail!("Dependency check failed");
    }
    Ok(())
}

/// Dependencies of a member manifest that don't inherit from the workspace.
fn non_workspace_deps(manifest: &Table) -> Vec<(String, Value)> {
    DEP_TABLES
        .iter()
        .filter_map(|t| manifest.get(*t).and_then(Value::as_table))
        .flat_map(|deps| deps.iter())
        .filter(|(_, v)| {
            !v.as_table()
                .and_then(|t| t.get("workspace"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn find_cargo_tomls(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut result = vec![];
    let walker = walkdir::WalkDir::new(dir).into_iter().filter_entry(|e| {
        e.depth() == 0
            || !e
                .file_name()
                .to_str()
                .is_some_and(|name| IGNORE_DIRS.contains(&name))
    });
    for entry in walker {
        let entry = entry?;
        if entry.file_name() == "Cargo.toml" {
            result.push(entry.into_path());
        }
    }
    result.sort();
    Ok(result)
}
