//! Content-addressed store of compiled operator libraries.
//!
//! An artifact is named by a SHA-256 fingerprint of everything that determines its bytes, so
//! a file that exists under its name is always safe to reuse. Builds happen in a scratch
//! directory under the cache root and are renamed into place, which keeps concurrent builders
//! (threads or processes) from ever observing a partial library.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    codegen::{GeneratedSource, SUPPORT_HEADER, SUPPORT_HEADER_NAME},
    device::Backend,
    toolchain::{lib_ext, Toolchain},
    Result,
};

/// A compiled library on disk and the entry point it exports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub entry: String,
    pub fingerprint: String,
    pub backend: Backend,
}

/// How often the cache was satisfied without a toolchain, and how often it was not.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub builds: usize,
}

#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    hits: AtomicUsize,
    builds: AtomicUsize,
}

impl ArtifactCache {
    /// Open (creating if needed) the cache at `root` and install the support header.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let include = root.join("include");
        fs::create_dir_all(&include)?;

        let header = include.join(SUPPORT_HEADER_NAME);
        let current = fs::read_to_string(&header).ok();
        if current.as_deref() != Some(SUPPORT_HEADER) {
            let mut staged = tempfile::NamedTempFile::new_in(&include)?;
            std::io::Write::write_all(&mut staged, SUPPORT_HEADER.as_bytes())?;
            staged.persist(&header).map_err(|e| e.error)?;
            debug!(path = %header.display(), "installed support header");
        }

        Ok(Self {
            root,
            hits: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn include_dir(&self) -> PathBuf {
        self.root.join("include")
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            builds: self.builds.load(Ordering::SeqCst),
        }
    }

    /// Hex SHA-256 over the backend, the toolchain identity, the support header and the source.
    pub fn fingerprint(&self, toolchain: &dyn Toolchain, source: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        for part in [
            toolchain.backend().name(),
            toolchain.identity()?.as_str(),
            SUPPORT_HEADER,
            source,
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn artifact_path(&self, name: &str, fingerprint: &str, backend: Backend) -> PathBuf {
        self.root
            .join(format!("lib{name}_{fingerprint}_{backend}{}", lib_ext()))
    }

    /// Return the artifact for `source`, building it unless a library with the same fingerprint
    /// already exists. `force` rebuilds and replaces an existing library.
    pub fn get_or_build(
        &self,
        toolchain: &dyn Toolchain,
        source: &GeneratedSource,
        force: bool,
    ) -> Result<Artifact> {
        let backend = toolchain.backend();
        let fingerprint = self.fingerprint(toolchain, &source.text)?;
        let path = self.artifact_path(&source.name, &fingerprint, backend);
        let artifact = Artifact {
            path,
            entry: source.entry.clone(),
            fingerprint,
            backend,
        };

        if !force && artifact.path.is_file() {
            self.hits.fetch_add(1, Ordering::SeqCst);
            debug!(op = %source.name, %backend, path = %artifact.path.display(), "cache hit");
            return Ok(artifact);
        }

        let staging = tempfile::Builder::new()
            .prefix(".build-")
            .tempdir_in(&self.root)?;
        let src = staging
            .path()
            .join(format!("{}.{}", source.name, toolchain.source_extension()));
        fs::write(&src, &source.text)?;
        let built = staging
            .path()
            .join(format!("lib{}{}", source.name, lib_ext()));
        toolchain.build(&src, &built)?;
        fs::rename(&built, &artifact.path)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        info!(op = %source.name, %backend, path = %artifact.path.display(), forced = force, "built artifact");

        if let Err(err) = staging.close() {
            warn!(%err, "failed to remove build directory");
        }
        Ok(artifact)
    }
}
