// Licensed under the Apache-2.0 license

use crate::error::{QspiError, QspiResult};
use log::info;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Copies the tree at `src` into `dst`, creating directories as needed.
///
/// Existing files in `dst` are replaced only when `overwrite` is set.
/// Anything other than directories and regular files is skipped. Returns
/// the number of files copied.
pub fn copy_recurse(src: &Path, dst: &Path, overwrite: bool) -> QspiResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            QspiError::file(path, e.into())
        })?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !target.exists() {
                fs::create_dir_all(&target).map_err(|e| QspiError::file(&target, e))?;
                let perms = entry
                    .metadata()
                    .map_err(|e| QspiError::file(entry.path(), e.into()))?
                    .permissions();
                fs::set_permissions(&target, perms).map_err(|e| QspiError::file(&target, e))?;
                info!("mkdir {}", target.display());
            }
        } else if file_type.is_file() && (overwrite || !target.exists()) {
            fs::copy(entry.path(), &target).map_err(|e| QspiError::file(entry.path(), e))?;
            info!("copy {} => {}", entry.path().display(), target.display());
            copied += 1;
        }
    }
    Ok(copied)
}
