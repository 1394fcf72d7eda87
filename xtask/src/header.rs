// Licensed under the Apache-2.0 license

//! License header check for the workspace sources.
//!
//! Only the root manifest and the workspace members are scanned. Every
//! `.rs` and `.toml` file must open with the header, written as a comment in
//! that file's syntax.

use crate::PROJECT_ROOT;
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use toml::{Table, Value};

const LICENSE: &str = "Licensed under the Apache-2.0 license";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Rust,
    Toml,
}

impl Syntax {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "rs" => Some(Syntax::Rust),
            "toml" => Some(Syntax::Toml),
            _ => None,
        }
    }

    fn header(self) -> String {
        match self {
            Syntax::Rust => format!("// {LICENSE}"),
            Syntax::Toml => format!("# {LICENSE}"),
        }
    }
}

/// Member directories named by `[workspace] members` in the root manifest.
fn members(root: &Path) -> Result<Vec<PathBuf>> {
    let manifest = root.join("Cargo.toml");
    let text = std::fs::read_to_string(&manifest)
        .with_context(|| format!("Failed to read {}", manifest.display()))?;
    let table = text.parse::<Table>()?;
    let members = table
        .get("workspace")
        .and_then(|w| w.get("members"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("{} has no workspace members", manifest.display()))?;
    members
        .iter()
        .map(|m| {
            m.as_str()
                .map(|m| root.join(m))
                .ok_or_else(|| anyhow!("workspace member {m} is not a string"))
        })
        .collect()
}

/// Sources subject to the header rule, sorted.
fn sources(root: &Path) -> Result<Vec<PathBuf>> {
    let mut result = vec![root.join("Cargo.toml")];
    for member in members(root)? {
        let walker = walkdir::WalkDir::new(&member)
            .into_iter()
            .filter_entry(|e| e.file_name() != "target");
        for entry in walker {
            let entry = entry?;
            if entry.file_type().is_file() && Syntax::of(entry.path()).is_some() {
                result.push(entry.into_path());
            }
        }
    }
    result.sort();
    result.dedup();
    Ok(result)
}

fn has_header(path: &Path, contents: &str) -> bool {
    match Syntax::of(path) {
        Some(syntax) => contents.lines().next() == Some(syntax.header().as_str()),
        None => true,
    }
}

fn with_header(path: &Path, contents: &str) -> Result<String> {
    let syntax = Syntax::of(path).ok_or_else(|| anyhow!("{} is not checked", path.display()))?;
    let sep = if contents.starts_with('\n') { "" } else { "\n" };
    Ok(format!("{}\n{sep}{contents}", syntax.header()))
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

/// Files under `root` missing the header.
fn missing(root: &Path) -> Result<Vec<PathBuf>> {
    let mut result = vec![];
    for path in sources(root)? {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", relative(root, &path)))?;
        if !has_header(&path, &contents) {
            result.push(path);
        }
    }
    Ok(result)
}

pub(crate) fn check() -> Result<()> {
    println!("Running: license header check");
    let missing = missing(&PROJECT_ROOT)?;
    for path in missing.iter() {
        println!(
            "{} does not start with the license header",
            relative(&PROJECT_ROOT, path)
        );
    }
    if !missing.is_empty() {
        bail!("Some files are missing the license header; to fix, run \"cargo xtask header-fix\" from the repo root");
    }
    Ok(())
}

pub(crate) fn fix() -> Result<()> {
    println!("Running: license header fix");
    for path in missing(&PROJECT_ROOT)? {
        println!("Fixing header in {}", relative(&PROJECT_ROOT, &path));
        let contents = std::fs::read_to_string(&path)?;
        std::fs::write(&path, with_header(&path, &contents)?)?;
    }
    Ok(())
}
