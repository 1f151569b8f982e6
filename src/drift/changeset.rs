//! Change-set model: header, directory entries, file entries.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scanner::digest::Digest;

/// Directory path used for files that live directly in the basedir.
pub const ROOT_DIRECTORY: &str = ".";

/// Whether a change-set is a full baseline or a delta against one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Coverage,
    Drift,
}

impl Category {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Coverage => "C",
            Self::Drift => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "C" => Some(Self::Coverage),
            "D" => Some(Self::Drift),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coverage => "coverage",
            Self::Drift => "drift",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Changed,
    Removed,
}

impl ChangeType {
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Added => "A",
            Self::Changed => "C",
            Self::Removed => "R",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "A" => Some(Self::Added),
            "C" => Some(Self::Changed),
            "R" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Identity of a change-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub definition_name: String,
    pub basedir_path: String,
    pub category: Category,
    pub version: u32,
}

/// One file's change. Which digests are present follows from the change
/// type: ADDED has only `new_digest`, REMOVED only `old_digest`, CHANGED
/// both. The constructors are the only way this crate builds entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_name: String,
    pub old_digest: Option<Digest>,
    pub new_digest: Option<Digest>,
    pub change_type: ChangeType,
}

impl FileEntry {
    pub fn added(file_name: impl Into<String>, new_digest: Digest) -> Self {
        Self {
            file_name: file_name.into(),
            old_digest: None,
            new_digest: Some(new_digest),
            change_type: ChangeType::Added,
        }
    }

    pub fn removed(file_name: impl Into<String>, old_digest: Digest) -> Self {
        Self {
            file_name: file_name.into(),
            old_digest: Some(old_digest),
            new_digest: None,
            change_type: ChangeType::Removed,
        }
    }

    pub fn changed(file_name: impl Into<String>, old_digest: Digest, new_digest: Digest) -> Self {
        Self {
            file_name: file_name.into(),
            old_digest: Some(old_digest),
            new_digest: Some(new_digest),
            change_type: ChangeType::Changed,
        }
    }

    /// Digest of the content this entry leaves on disk, if any.
    pub fn current_digest(&self) -> Option<&Digest> {
        match self.change_type {
            ChangeType::Added | ChangeType::Changed => self.new_digest.as_ref(),
            ChangeType::Removed => None,
        }
    }
}

/// A directory and the file changes inside it. Never empty once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub directory: String,
    pub files: Vec<FileEntry>,
}

impl DirectoryEntry {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_file(mut self, entry: FileEntry) -> Self {
        self.files.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Basedir-relative path of one of this directory's files.
    pub fn file_path(&self, file_name: &str) -> String {
        join_relative(&self.directory, file_name)
    }
}

/// Join a change-set directory and a file name into a relative path.
pub fn join_relative(directory: &str, file_name: &str) -> String {
    if directory == ROOT_DIRECTORY || directory.is_empty() {
        file_name.to_string()
    } else {
        format!("{directory}/{file_name}")
    }
}

/// Split a relative path into `(directory, file_name)`.
pub fn split_relative(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => (ROOT_DIRECTORY, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::digest::digest;

    #[test]
    fn codes_round_trip() {
        for c in [Category::Coverage, Category::Drift] {
            assert_eq!(Category::from_code(c.code()), Some(c));
        }
        for t in [ChangeType::Added, ChangeType::Changed, ChangeType::Removed] {
            assert_eq!(ChangeType::from_flag(t.flag()), Some(t));
        }
        assert_eq!(Category::from_code("X"), None);
        assert_eq!(ChangeType::from_flag("a"), None);
    }

    #[test]
    fn constructors_set_digests_by_change_type() {
        let h = digest(b"h");
        assert_eq!(FileEntry::added("a", h.clone()).old_digest, None);
        assert_eq!(FileEntry::removed("a", h.clone()).new_digest, None);
        assert_eq!(FileEntry::removed("a", h.clone()).current_digest(), None);
        let changed = FileEntry::changed("a", digest(b"old"), h.clone());
        assert_eq!(changed.current_digest(), Some(&h));
    }

    #[test]
    fn relative_paths_split_and_join() {
        assert_eq!(split_relative("a.conf"), (".", "a.conf"));
        assert_eq!(split_relative("conf/sub/x.xml"), ("conf/sub", "x.xml"));
        assert_eq!(join_relative(".", "a.conf"), "a.conf");
        assert_eq!(join_relative("conf", "x.xml"), "conf/x.xml");
    }
}
