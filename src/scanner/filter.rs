//! Include/exclude filters for drift definitions.
//!
//! A filter is a directory path relative to the basedir plus an optional
//! shell-style glob. Without a pattern it matches every file under the
//! directory, recursively. With a pattern, the glob is anchored at the
//! directory: `*` stays within one path component, `**` crosses components,
//! `?` matches a single non-separator character.

#![allow(missing_docs)]

use regex::Regex;

use crate::core::errors::{DriftError, Result};
use crate::drift::definition::{DriftDefinition, Filter};

/// One compiled filter.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    original: Filter,
    kind: FilterKind,
}

#[derive(Debug, Clone)]
enum FilterKind {
    /// Everything at or below this prefix (empty prefix = whole basedir).
    Subtree(String),
    Glob(Regex),
}

impl CompiledFilter {
    pub fn compile(filter: &Filter) -> Result<Self> {
        let prefix = normalize_filter_path(&filter.path)?;
        let kind = match filter.pattern.as_deref().map(str::trim) {
            None | Some("") => FilterKind::Subtree(prefix),
            Some(pattern) => {
                let pattern = pattern.replace('\\', "/");
                let full = if prefix.is_empty() {
                    pattern
                } else {
                    format!("{prefix}/{pattern}")
                };
                FilterKind::Glob(glob_to_regex(&full)?)
            }
        };
        Ok(Self {
            original: filter.clone(),
            kind,
        })
    }

    /// Whether a basedir-relative, `/`-separated file path matches.
    pub fn matches(&self, relative: &str) -> bool {
        match &self.kind {
            FilterKind::Subtree(prefix) => {
                prefix.is_empty()
                    || relative == prefix
                    || relative
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            FilterKind::Glob(re) => re.is_match(relative),
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.original
    }
}

/// The include and exclude filters of one definition.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    includes: Vec<CompiledFilter>,
    excludes: Vec<CompiledFilter>,
}

impl FilterSet {
    pub fn new(includes: &[Filter], excludes: &[Filter]) -> Result<Self> {
        Ok(Self {
            includes: includes
                .iter()
                .map(CompiledFilter::compile)
                .collect::<Result<Vec<_>>>()?,
            excludes: excludes
                .iter()
                .map(CompiledFilter::compile)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn for_definition(definition: &DriftDefinition) -> Result<Self> {
        Self::new(&definition.includes, &definition.excludes)
    }

    /// Includes first (at least one must match when any are declared), then
    /// excludes (any match rejects).
    pub fn accepts(&self, relative: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|f| f.matches(relative)) {
            return false;
        }
        !self.excludes.iter().any(|f| f.matches(relative))
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }
}

/// Validate that a filter compiles.
pub fn validate_filter(filter: &Filter) -> Result<()> {
    CompiledFilter::compile(filter).map(|_| ())
}

fn normalize_filter_path(raw: &str) -> Result<String> {
    let unified = raw.trim().replace('\\', "/");
    if unified.starts_with('/') {
        return Err(DriftError::InvalidDefinition {
            details: format!("filter path must be relative to the basedir: {raw:?}"),
        });
    }
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(DriftError::InvalidDefinition {
                    details: format!("filter path may not leave the basedir: {raw:?}"),
                });
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Convert a shell-style glob pattern to an anchored regex.
///
/// Supports:
/// - `**/` → zero or more leading directories
/// - `**`  → matches any path (including separators)
/// - `*`   → matches anything except `/`
/// - `?`   → matches a single character except `/`
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                if i + 2 < chars.len() && chars[i + 2] == '/' {
                    regex_str.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex_str.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex_str.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex_str.push_str("[^/]");
                i += 1;
            }
            '.' | '+' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex_str.push('\\');
                regex_str.push(chars[i]);
                i += 1;
            }
            c => {
                regex_str.push(c);
                i += 1;
            }
        }
    }

    regex_str.push('$');

    Regex::new(&regex_str).map_err(|err| DriftError::InvalidDefinition {
        details: format!("invalid filter glob {pattern:?}: {err}"),
    })
}
