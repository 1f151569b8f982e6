//! Zip upload bundles.

#![allow(missing_docs)]

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::core::errors::{DriftError, Result};

/// One file to place in a bundle under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub name: String,
    pub source: PathBuf,
}

impl BundleFile {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Write a deflated zip of `files` at `path` (temp file + rename) and return
/// its size in bytes.
pub fn write_bundle(path: &Path, files: &[BundleFile]) -> Result<u64> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = write_zip(&tmp, files);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    fs::rename(&tmp, path).map_err(|e| DriftError::io(path, e))?;
    let size = fs::metadata(path).map_err(|e| DriftError::io(path, e))?.len();
    Ok(size)
}

fn write_zip(tmp: &Path, files: &[BundleFile]) -> Result<()> {
    let file = File::create(tmp).map_err(|e| DriftError::io(tmp, e))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in files {
        zip.start_file(entry.name.as_str(), options)
            .map_err(|err| DriftError::archive(tmp, err))?;
        let mut source = File::open(&entry.source).map_err(|e| DriftError::io(&entry.source, e))?;
        io::copy(&mut source, &mut zip).map_err(|e| DriftError::io(&entry.source, e))?;
    }
    let file = zip.finish().map_err(|err| DriftError::archive(tmp, err))?;
    file.sync_all().map_err(|e| DriftError::io(tmp, e))
}

/// Names of the entries in a bundle, in archive order.
pub fn entry_names(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| DriftError::io(path, e))?;
    let archive = zip::ZipArchive::new(file).map_err(|err| DriftError::archive(path, err))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Full content of one bundle entry.
pub fn read_entry(path: &Path, name: &str) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| DriftError::io(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| DriftError::archive(path, err))?;
    let mut entry = archive
        .by_name(name)
        .map_err(|err| DriftError::archive(path, err))?;
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(|e| DriftError::io(path, e))?;
    Ok(buf)
}
