//! Path helpers shared by configuration and the CLI.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Make `path` absolute against the current directory and fold `.`/`..`
/// lexically. Symlinks are left alone: a data directory reached through a
/// symlink keeps that spelling.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return PathBuf::new();
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };
    fold_components(&absolute)
}

fn fold_components(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                } else if out.is_empty() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out.into_iter().collect()
}

/// Basedir values are compared as strings; drop a trailing `/` except on
/// the root itself.
pub fn trim_trailing_separator(value: &str) -> &str {
    if value.len() > 1 {
        value.strip_suffix('/').unwrap_or(value)
    } else {
        value
    }
}
