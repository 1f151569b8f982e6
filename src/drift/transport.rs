//! Seams to the outside world: the server that receives bundles and the
//! agent-side client that resolves base directories.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::errors::{DriftError, Result};
use crate::drift::definition::{BaseDirContext, BaseDirectory, DriftDefinition, ResourceId};
use crate::drift::store::encode_name;

/// Receives upload bundles. A returned error means the bundle was not
/// accepted and must be retried later.
pub trait DriftServer: Send + Sync {
    fn send_change_set_bundle(
        &self,
        resource_id: ResourceId,
        size: u64,
        stream: &mut dyn Read,
    ) -> Result<()>;

    fn send_content_bundle(
        &self,
        resource_id: ResourceId,
        definition_name: &str,
        token: &str,
        size: u64,
        stream: &mut dyn Read,
    ) -> Result<()>;
}

/// Agent-side callbacks.
pub trait DriftClient: Send + Sync {
    /// The resolved basedir of a scheduled definition does not exist.
    fn report_missing_base_directory(
        &self,
        resource_id: ResourceId,
        definition: &DriftDefinition,
        path: &Path,
    );

    /// Turn a logical basedir into an absolute path for one resource.
    fn resolve_base_directory(
        &self,
        resource_id: ResourceId,
        basedir: &BaseDirectory,
    ) -> Result<PathBuf>;
}

// ──────────────────── spool server ────────────────────

/// Drops every bundle into `<outbox>/<resourceId>/` for a separate
/// forwarder to ship. Files appear atomically (temp + rename).
#[derive(Debug)]
pub struct SpoolServer {
    outbox: PathBuf,
    seq: AtomicU64,
}

impl SpoolServer {
    pub fn new(outbox: impl Into<PathBuf>) -> Result<Self> {
        let outbox = outbox.into();
        fs::create_dir_all(&outbox).map_err(|e| DriftError::io(&outbox, e))?;
        Ok(Self {
            outbox,
            seq: AtomicU64::new(0),
        })
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn spool(&self, resource_id: ResourceId, name: &str, size: u64, stream: &mut dyn Read) -> Result<PathBuf> {
        let dir = self.outbox.join(resource_id.to_string());
        fs::create_dir_all(&dir).map_err(|e| DriftError::io(&dir, e))?;
        let target = dir.join(name);
        let tmp = dir.join(format!(".{name}.tmp"));

        let copied = (|| -> io::Result<u64> {
            let mut out = File::create(&tmp)?;
            let n = io::copy(stream, &mut out)?;
            out.flush()?;
            out.sync_all()?;
            Ok(n)
        })();
        let copied = match copied {
            Ok(n) => n,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(DriftError::io(&tmp, err));
            }
        };
        if copied != size {
            let _ = fs::remove_file(&tmp);
            return Err(DriftError::Transport {
                details: format!("bundle {name}: expected {size} bytes, received {copied}"),
            });
        }
        fs::rename(&tmp, &target).map_err(|e| DriftError::io(&target, e))?;
        tracing::debug!(path = %target.display(), bytes = size, "bundle spooled");
        Ok(target)
    }

    fn next_stamp(&self) -> String {
        format!(
            "{}-{:06}",
            chrono::Utc::now().timestamp_millis(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        )
    }
}

impl DriftServer for SpoolServer {
    fn send_change_set_bundle(
        &self,
        resource_id: ResourceId,
        size: u64,
        stream: &mut dyn Read,
    ) -> Result<()> {
        let name = format!("changeset_{}.zip", self.next_stamp());
        self.spool(resource_id, &name, size, stream).map(|_| ())
    }

    fn send_content_bundle(
        &self,
        resource_id: ResourceId,
        definition_name: &str,
        token: &str,
        size: u64,
        stream: &mut dyn Read,
    ) -> Result<()> {
        let name = format!("content_{}_{token}.zip", encode_name(definition_name));
        self.spool(resource_id, &name, size, stream).map(|_| ())
    }
}

// ──────────────────── filesystem client ────────────────────

/// Resolves `fileSystem` basedirs as literal paths and the other contexts
/// from per-resource properties registered up front. Missing basedirs are
/// logged.
#[derive(Debug, Default)]
pub struct FileSystemClient {
    properties: HashMap<(ResourceId, BaseDirContext, String), String>,
}

impl FileSystemClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the value of a resource property for basedir resolution.
    #[must_use]
    pub fn with_property(
        mut self,
        resource_id: ResourceId,
        context: BaseDirContext,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.properties
            .insert((resource_id, context, name.into()), value.into());
        self
    }
}

impl DriftClient for FileSystemClient {
    fn report_missing_base_directory(
        &self,
        resource_id: ResourceId,
        definition: &DriftDefinition,
        path: &Path,
    ) {
        tracing::warn!(
            resource_id,
            definition = %definition.name,
            path = %path.display(),
            "base directory does not exist"
        );
    }

    fn resolve_base_directory(
        &self,
        resource_id: ResourceId,
        basedir: &BaseDirectory,
    ) -> Result<PathBuf> {
        let raw = match basedir.context {
            BaseDirContext::FileSystem => basedir.value.clone(),
            context => self
                .properties
                .get(&(resource_id, context, basedir.value.clone()))
                .cloned()
                .ok_or_else(|| DriftError::InvalidDefinition {
                    details: format!(
                        "resource {resource_id} has no {context:?} property {:?}",
                        basedir.value
                    ),
                })?,
        };
        Ok(PathBuf::from(raw))
    }
}
