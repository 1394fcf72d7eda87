// Licensed under the Apache-2.0 license

use anyhow::Result;

pub(crate) fn precheckin() -> Result<()> {
    crate::cargo::cargo_lock()?;
    crate::cargo::format()?;
    crate::cargo::clippy()?;
    crate::header::check()?;
    crate::deps::check()?;
    crate::cargo::test()
}
