//! Line-based change-set codec.
//!
//! ```text
//! <definitionName>
//! <basedirPath>
//! <category code: C | D>
//! <version>
//! <relativeDirPath> <fileCount>
//! <newDigest> A <fileName>
//! <oldDigest> R <fileName>
//! <newDigest> C <fileName> <oldDigest>
//! ...
//! <blank line>
//! ```
//!
//! Names may contain spaces: directory lines split the count off the right,
//! file lines split the digest and flag off the left and (for CHANGED) the
//! old digest off the right. The reader is a forward-only iterator yielding
//! one `Result<DirectoryEntry>` per directory, so a large change-set is never
//! materialized and a malformed record surfaces as an `Err` item rather than
//! a panic. After the first error the iterator is exhausted.

#![allow(missing_docs)]

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::core::errors::{DriftError, Result};
use crate::drift::changeset::{Category, ChangeType, DirectoryEntry, FileEntry, Header};
use crate::scanner::digest::Digest;

// ──────────────────── writer ────────────────────

/// Streams a change-set to any `Write`.
pub struct ChangeSetWriter<W: Write> {
    out: W,
    directories: usize,
    files: usize,
}

impl<W: Write> ChangeSetWriter<W> {
    /// Write the header and return a writer positioned at the first entry.
    pub fn new(mut out: W, header: &Header) -> Result<Self> {
        check_single_line("definition name", &header.definition_name)?;
        check_single_line("basedir path", &header.basedir_path)?;
        if header.definition_name.is_empty() {
            return Err(DriftError::InvalidChangeSet {
                details: "definition name must not be empty".to_string(),
            });
        }
        writeln!(
            out,
            "{}\n{}\n{}\n{}",
            header.definition_name,
            header.basedir_path,
            header.category.code(),
            header.version
        )
        .map_err(write_err)?;
        Ok(Self {
            out,
            directories: 0,
            files: 0,
        })
    }

    /// Append one directory. Empty directories are skipped, never written.
    pub fn write_directory(&mut self, entry: &DirectoryEntry) -> Result<()> {
        if entry.is_empty() {
            return Ok(());
        }
        check_single_line("directory", &entry.directory)?;
        if entry.directory.is_empty() {
            return Err(DriftError::InvalidChangeSet {
                details: "directory path must not be empty".to_string(),
            });
        }
        for file in &entry.files {
            check_file_entry(file)?;
        }

        writeln!(self.out, "{} {}", entry.directory, entry.files.len()).map_err(write_err)?;
        for file in &entry.files {
            write_file_line(&mut self.out, file)?;
        }
        self.directories += 1;
        self.files += entry.files.len();
        Ok(())
    }

    /// Write the blank terminator line, flush, and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        writeln!(self.out).map_err(write_err)?;
        self.out.flush().map_err(write_err)?;
        Ok(self.out)
    }

    pub fn directories_written(&self) -> usize {
        self.directories
    }

    pub fn files_written(&self) -> usize {
        self.files
    }
}

/// Encode a whole change-set into `out`.
pub fn write_change_set<'a, W, I>(out: W, header: &Header, entries: I) -> Result<W>
where
    W: Write,
    I: IntoIterator<Item = &'a DirectoryEntry>,
{
    let mut writer = ChangeSetWriter::new(out, header)?;
    for entry in entries {
        writer.write_directory(entry)?;
    }
    writer.finish()
}

/// Encode a change-set to a file (not atomically; callers rename into place).
pub fn write_change_set_file(path: &Path, header: &Header, entries: &[DirectoryEntry]) -> Result<()> {
    let file = File::create(path).map_err(|e| DriftError::io(path, e))?;
    let out = write_change_set(BufWriter::new(file), header, entries)?;
    let file = out
        .into_inner()
        .map_err(|e| DriftError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| DriftError::io(path, e))
}

fn write_file_line<W: Write>(out: &mut W, file: &FileEntry) -> Result<()> {
    match (file.change_type, &file.old_digest, &file.new_digest) {
        (ChangeType::Added, _, Some(new)) => writeln!(out, "{new} A {}", file.file_name),
        (ChangeType::Removed, Some(old), _) => writeln!(out, "{old} R {}", file.file_name),
        (ChangeType::Changed, Some(old), Some(new)) => {
            writeln!(out, "{new} C {} {old}", file.file_name)
        }
        _ => {
            return Err(DriftError::InvalidChangeSet {
                details: format!("entry {:?} is missing a digest", file.file_name),
            });
        }
    }
    .map_err(write_err)
}

fn check_file_entry(file: &FileEntry) -> Result<()> {
    check_single_line("file name", &file.file_name)?;
    if file.file_name.is_empty() || file.file_name.contains('/') {
        return Err(DriftError::InvalidChangeSet {
            details: format!("invalid file name {:?}", file.file_name),
        });
    }
    let ok = match file.change_type {
        ChangeType::Added => file.new_digest.is_some(),
        ChangeType::Removed => file.old_digest.is_some(),
        ChangeType::Changed => file.old_digest.is_some() && file.new_digest.is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(DriftError::InvalidChangeSet {
            details: format!(
                "{:?} entry {:?} is missing a digest",
                file.change_type, file.file_name
            ),
        })
    }
}

fn check_single_line(what: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(DriftError::InvalidChangeSet {
            details: format!("{what} contains a line break: {value:?}"),
        });
    }
    Ok(())
}

fn write_err(source: std::io::Error) -> DriftError {
    DriftError::StreamIo {
        context: "change-set write",
        source,
    }
}

// ──────────────────── reader ────────────────────

/// Lazy change-set reader over any `BufRead`.
pub struct ChangeSetReader<R: BufRead> {
    input: R,
    header: Header,
    line_no: usize,
    buf: String,
    done: bool,
}

impl ChangeSetReader<BufReader<File>> {
    /// Open a change-set file and parse its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| DriftError::io(path, e))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: BufRead> ChangeSetReader<R> {
    /// Parse the header eagerly; entries are decoded on demand.
    pub fn new(input: R) -> Result<Self> {
        let mut reader = Self {
            input,
            header: Header {
                definition_name: String::new(),
                basedir_path: String::new(),
                category: Category::Coverage,
                version: 0,
            },
            line_no: 0,
            buf: String::new(),
            done: false,
        };

        let definition_name = reader.required_line("definition name")?;
        if definition_name.is_empty() {
            return Err(DriftError::format(reader.line_no, "empty definition name"));
        }
        let basedir_path = reader.required_line("basedir path")?;
        let code = reader.required_line("category")?;
        let category = Category::from_code(&code).ok_or_else(|| {
            DriftError::format(reader.line_no, format!("unknown category code {code:?}"))
        })?;
        let raw_version = reader.required_line("version")?;
        let version = raw_version.parse::<u32>().map_err(|_| {
            DriftError::format(reader.line_no, format!("invalid version {raw_version:?}"))
        })?;

        reader.header = Header {
            definition_name,
            basedir_path,
            category,
            version,
        };
        Ok(reader)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Drain every entry, failing on the first malformed one.
    pub fn read_all(self) -> Result<(Header, Vec<DirectoryEntry>)> {
        let header = self.header.clone();
        let entries = self.collect::<Result<Vec<_>>>()?;
        Ok((header, entries))
    }

    /// Load the next line into `buf` without its terminator. `false` at end
    /// of input.
    fn advance(&mut self) -> Result<bool> {
        self.buf.clear();
        let read = self
            .input
            .read_line(&mut self.buf)
            .map_err(|source| DriftError::StreamIo {
                context: "change-set read",
                source,
            })?;
        if read == 0 {
            return Ok(false);
        }
        self.line_no += 1;
        if self.buf.ends_with('\n') {
            self.buf.pop();
            if self.buf.ends_with('\r') {
                self.buf.pop();
            }
        }
        Ok(true)
    }

    fn required_line(&mut self, what: &str) -> Result<String> {
        if self.advance()? {
            Ok(self.buf.clone())
        } else {
            Err(DriftError::format(self.line_no + 1, format!("missing {what}")))
        }
    }

    fn read_directory(&mut self) -> Result<Option<DirectoryEntry>> {
        if !self.advance()? {
            return Err(DriftError::format(
                self.line_no + 1,
                "unexpected end of change-set (missing blank terminator)",
            ));
        }
        let line_no = self.line_no;
        let line = self.buf.as_str();
        if line.is_empty() {
            return Ok(None);
        }
        if parse_file_line(line).is_ok() {
            return Err(DriftError::format(
                line_no,
                "found a file record where a directory record was expected",
            ));
        }
        let (directory, count) = line
            .rsplit_once(' ')
            .ok_or_else(|| DriftError::format(line_no, "directory record has no file count"))?;
        let count = count.parse::<usize>().map_err(|_| {
            DriftError::format(line_no, format!("invalid file count {count:?}"))
        })?;
        if directory.is_empty() {
            return Err(DriftError::format(line_no, "empty directory path"));
        }
        if count == 0 {
            return Err(DriftError::format(
                line_no,
                format!("directory {directory:?} declares zero files"),
            ));
        }

        let mut entry = DirectoryEntry::new(directory);
        entry.files.reserve(count);
        for found in 0..count {
            if !self.advance()? {
                return Err(DriftError::format(
                    self.line_no + 1,
                    format!(
                        "directory {:?} declared {count} files, found {found}",
                        entry.directory
                    ),
                ));
            }
            let file = parse_file_line(&self.buf).map_err(|details| {
                DriftError::format(
                    self.line_no,
                    format!(
                        "directory {:?} declared {count} files, found {found}: {details}",
                        entry.directory
                    ),
                )
            })?;
            entry.files.push(file);
        }
        Ok(Some(entry))
    }
}

impl<R: BufRead> Iterator for ChangeSetReader<R> {
    type Item = Result<DirectoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_directory() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: BufRead> std::iter::FusedIterator for ChangeSetReader<R> {}

fn parse_file_line(line: &str) -> std::result::Result<FileEntry, String> {
    let (first, rest) = line
        .split_once(' ')
        .ok_or_else(|| format!("malformed file record {line:?}"))?;
    let first = Digest::parse(first).ok_or_else(|| format!("invalid digest {first:?}"))?;
    let (flag, rest) = rest
        .split_once(' ')
        .ok_or_else(|| format!("malformed file record {line:?}"))?;
    let change_type =
        ChangeType::from_flag(flag).ok_or_else(|| format!("unknown change flag {flag:?}"))?;

    let entry = match change_type {
        ChangeType::Added => FileEntry::added(rest, first),
        ChangeType::Removed => FileEntry::removed(rest, first),
        ChangeType::Changed => {
            let (name, old) = rest
                .rsplit_once(' ')
                .ok_or_else(|| format!("changed record without old digest {line:?}"))?;
            let old = Digest::parse(old).ok_or_else(|| format!("invalid old digest {old:?}"))?;
            FileEntry::changed(name, old, first)
        }
    };
    if entry.file_name.is_empty() {
        return Err(format!("empty file name in {line:?}"));
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::digest::digest;

    fn header(category: Category) -> Header {
        Header {
            definition_name: "app conf".to_string(),
            basedir_path: "/opt/app".to_string(),
            category,
            version: 3,
        }
    }

    fn sample_entries() -> Vec<DirectoryEntry> {
        vec![
            DirectoryEntry::new(".")
                .with_file(FileEntry::removed("a.conf", digest(b"1")))
                .with_file(FileEntry::added("b.conf", digest(b"2"))),
            DirectoryEntry::new("conf/with space").with_file(FileEntry::changed(
                "server file.xml",
                digest(b"old"),
                digest(b"new"),
            )),
        ]
    }

    fn encode(header: &Header, entries: &[DirectoryEntry]) -> String {
        String::from_utf8(write_change_set(Vec::new(), header, entries).unwrap()).unwrap()
    }

    #[test]
    fn encodes_documented_layout() {
        let text = encode(&header(Category::Drift), &sample_entries());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "app conf");
        assert_eq!(lines[1], "/opt/app");
        assert_eq!(lines[2], "D");
        assert_eq!(lines[3], "3");
        assert_eq!(lines[4], ". 2");
        assert_eq!(lines[5], format!("{} R a.conf", digest(b"1")));
        assert_eq!(lines[6], format!("{} A b.conf", digest(b"2")));
        assert_eq!(lines[7], "conf/with space 1");
        assert_eq!(
            lines[8],
            format!("{} C server file.xml {}", digest(b"new"), digest(b"old"))
        );
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn round_trips_header_and_entries() {
        let text = encode(&header(Category::Drift), &sample_entries());
        let reader = ChangeSetReader::new(text.as_bytes()).unwrap();
        let (decoded_header, decoded) = reader.read_all().unwrap();
        assert_eq!(decoded_header, header(Category::Drift));
        assert_eq!(decoded, sample_entries());
    }

    #[test]
    fn empty_directories_are_never_written() {
        let mut entries = sample_entries();
        entries.insert(1, DirectoryEntry::new("empty"));
        let text = encode(&header(Category::Drift), &entries);
        assert!(!text.contains("empty 0"));
        let (_, decoded) = ChangeSetReader::new(text.as_bytes())
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(decoded, sample_entries());
    }

    #[test]
    fn reader_is_lazy_and_fused() {
        let text = encode(&header(Category::Coverage), &sample_entries());
        let mut reader = ChangeSetReader::new(text.as_bytes()).unwrap();
        assert_eq!(reader.header().version, 3);
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn fewer_files_than_declared_is_a_format_error() {
        let d = digest(b"x");
        let text = format!("def\n/b\nC\n0\n. 2\n{d} A a\nsub 1\n{d} A b\n\n");
        let mut reader = ChangeSetReader::new(text.as_bytes()).unwrap();
        let err = reader.next().unwrap().unwrap_err();
        assert_eq!(err.code(), "DRIFT-2001");
        assert!(err.to_string().contains("declared 2 files, found 1"), "{err}");
        assert!(reader.next().is_none());
    }

    #[test]
    fn more_files_than_declared_is_a_format_error() {
        let d = digest(b"x");
        let text = format!("def\n/b\nC\n0\n. 1\n{d} A a\n{d} A b\n\n");
        let mut reader = ChangeSetReader::new(text.as_bytes()).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("file record"), "{err}");
    }

    #[test]
    fn missing_terminator_is_a_format_error() {
        let d = digest(b"x");
        let text = format!("def\n/b\nC\n0\n. 1\n{d} A a\n");
        let mut reader = ChangeSetReader::new(text.as_bytes()).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().unwrap().is_err());
    }

    #[test]
    fn zero_declared_files_rejected() {
        let text = "def\n/b\nD\n1\nconf 0\n\n";
        let mut reader = ChangeSetReader::new(text.as_bytes()).unwrap();
        assert!(reader.next().unwrap().is_err());
    }

    #[test]
    fn bad_header_rejected() {
        assert!(ChangeSetReader::new("def\n/b\nX\n0\n\n".as_bytes()).is_err());
        assert!(ChangeSetReader::new("def\n/b\nC\nnope\n\n".as_bytes()).is_err());
        assert!(ChangeSetReader::new("def\n".as_bytes()).is_err());
    }

    #[test]
    fn writer_rejects_multiline_names() {
        let entry = DirectoryEntry::new(".").with_file(FileEntry::added("a\nb", digest(b"x")));
        let mut writer = ChangeSetWriter::new(Vec::new(), &header(Category::Coverage)).unwrap();
        let err = writer.write_directory(&entry).unwrap_err();
        assert_eq!(err.code(), "DRIFT-2002");
    }

    #[test]
    fn writer_rejects_entries_missing_digests() {
        let entry = DirectoryEntry::new(".").with_file(FileEntry {
            file_name: "a".to_string(),
            old_digest: None,
            new_digest: None,
            change_type: ChangeType::Added,
        });
        let mut writer = ChangeSetWriter::new(Vec::new(), &header(Category::Coverage)).unwrap();
        assert!(writer.write_directory(&entry).is_err());
    }

    #[test]
    fn writer_counts_directories_and_files() {
        let mut writer = ChangeSetWriter::new(Vec::new(), &header(Category::Drift)).unwrap();
        for entry in &sample_entries() {
            writer.write_directory(entry).unwrap();
        }
        assert_eq!(writer.directories_written(), 2);
        assert_eq!(writer.files_written(), 3);
    }

    #[test]
    fn file_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changeset.txt");
        write_change_set_file(&path, &header(Category::Drift), &sample_entries()).unwrap();
        let (h, entries) = ChangeSetReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(h, header(Category::Drift));
        assert_eq!(entries, sample_entries());
    }
}
