//! Home directory resolution.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(raw: &str) -> Result<PathBuf> {
    if raw == "~" {
        return user_home();
    }
    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        return Ok(user_home()?.join(rest));
    }
    Ok(PathBuf::from(raw))
}

/// Resolve the host's home directory.
///
/// `configured` wins when present (`~` is expanded, relative paths are taken from the
/// current directory); otherwise `<user home>/<default_subdir>`. With `create` the
/// directory is created if missing.
pub fn resolve_home_dir(
    configured: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf> {
    let raw = match configured {
        Some(p) if !p.trim().is_empty() => expand_tilde(p.trim())?,
        _ => user_home()?.join(default_subdir),
    };
    let abs = absolutize(&raw)?;

    if create {
        std::fs::create_dir_all(&abs)
            .with_context(|| format!("failed to create home dir {}", abs.display()))?;
    } else if abs.exists() && !abs.is_dir() {
        bail!("home dir {} exists and is not a directory", abs.display());
    }
    Ok(abs)
}

/// Join a relative path onto the current directory.
pub fn absolutize(p: &Path) -> Result<PathBuf> {
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir().context("current directory is not accessible")?;
    Ok(cwd.join(p))
}

fn user_home() -> Result<PathBuf> {
    dirs::home_dir().context("user home directory cannot be determined")
}
