// Licensed under the Apache-2.0 license

//! Thin wrappers around cargo invocations run from the workspace root.

use crate::PROJECT_ROOT;
use anyhow::{bail, Result};
use std::process::{Command, Stdio};

fn cargo(args: &[&str], quiet: bool) -> Result<bool> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(&*PROJECT_ROOT).args(args);
    if quiet {
        cmd.stdout(Stdio::null());
    }
    Ok(cmd.status()?.success())
}

pub(crate) fn cargo_lock() -> Result<()> {
    println!("Checking Cargo lock");
    if !cargo(&["tree", "--locked"], true)? {
        bail!("cargo tree --locked failed; Please include required changes to Cargo.lock in your pull request");
    }
    Ok(())
}

pub(crate) fn clippy() -> Result<()> {
    println!("Running: cargo clippy");
    let args = [
        "clippy",
        "--workspace",
        "--all-targets",
        "--",
        "-D",
        "warnings",
        "--no-deps",
    ];
    if !cargo(&args, false)? {
        bail!("cargo clippy failed");
    }
    Ok(())
}

pub(crate) fn format() -> Result<()> {
    println!("Running: cargo fmt");
    if !cargo(&["fmt", "--check", "--all"], false)? {
        bail!("cargo fmt failed");
    }
    Ok(())
}

pub(crate) fn test() -> Result<()> {
    println!("Running: cargo test");
    if !cargo(&["test", "--workspace"], false)? {
        bail!("cargo test failed");
    }
    Ok(())
}
