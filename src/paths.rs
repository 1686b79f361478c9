use std::path::{Path, PathBuf};

use crate::error::Result;

/// Resolves where a downloaded file lands locally.
///
/// With no `local` a unique temp directory is synthesized and the remote
/// name used inside it; a `local` directory gets the remote name appended;
/// a `local` file path is used as-is and will be overwritten.
pub(crate) fn resolve_download_target(
    local: Option<&Path>,
    remote_name: &str,
) -> Result<PathBuf> {
    match local {
        None => {
            let dir = unique_temp_dir()?;
            Ok(dir.join(remote_name))
        }
        Some(path) if path.is_dir() => Ok(path.join(remote_name)),
        Some(path) => Ok(path.to_path_buf()),
    }
}

/// A fresh directory under the system temp dir.
pub(crate) fn unique_temp_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("easycontainers-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Single-quotes a string for `sh -c`, the only quoting the exec-based
/// transfer commands need.
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:".contains(c))
    {
        return value.to_owned();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
