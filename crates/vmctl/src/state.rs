//! Descriptor persistence and the cached region list.
//!
//! Layout, per provider and per working directory:
//!
//! ```text
//! <state-root>/<provider>/descriptor.json
//! <state-root>/<provider>/regions.json
//! <state-root>/<provider>/logs/commands.log
//! ```
//!
//! The descriptor file is the single source of truth: it is read fresh at
//! the start of every operation and replaced atomically (write to a temp
//! file in the same directory, then rename). Concurrent writers are last
//! write wins.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::descriptor::VmDescriptor;
use crate::error::VmError;
use crate::providers::{ProviderAdapter, ProviderKind};

/// Default state root, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".vmctl";

/// File locations for one provider.
#[derive(Debug, Clone)]
pub struct StateLayout {
    dir: PathBuf,
}

impl StateLayout {
    /// Layout for `provider` under `root`.
    #[must_use]
    pub fn new(root: &Path, provider: ProviderKind) -> Self {
        Self {
            dir: root.join(provider.name()),
        }
    }

    /// Provider state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persisted descriptor.
    #[must_use]
    pub fn descriptor_file(&self) -> PathBuf {
        self.dir.join("descriptor.json")
    }

    /// Cached region list.
    #[must_use]
    pub fn regions_file(&self) -> PathBuf {
        self.dir.join("regions.json")
    }

    /// Command log.
    #[must_use]
    pub fn command_log(&self) -> PathBuf {
        self.dir.join("logs").join("commands.log")
    }
}

/// Load/store of the single descriptor.
pub trait DescriptorStore: Send + Sync {
    /// Current descriptor, or an empty one if nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the stored record cannot be read.
    fn load(&self) -> Result<VmDescriptor, VmError>;

    /// Replace the stored descriptor.
    ///
    /// # Errors
    /// Returns an error if the record cannot be written.
    fn save(&self, vm: &VmDescriptor) -> Result<(), VmError>;

    /// Remove the stored descriptor.
    ///
    /// # Errors
    /// Returns an error if the record exists but cannot be removed.
    fn clear(&self) -> Result<(), VmError>;
}

/// [`DescriptorStore`] backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DescriptorStore for JsonFileStore {
    fn load(&self) -> Result<VmDescriptor, VmError> {
        if !self.path.exists() {
            return Ok(VmDescriptor::default());
        }
        let vm: VmDescriptor = read_json(&self.path)?;
        debug!(path = %self.path.display(), id = ?vm.id(), "Loaded descriptor");
        Ok(vm)
    }

    fn save(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        write_json_atomic(&self.path, vm)?;
        debug!(path = %self.path.display(), id = ?vm.id(), "Saved descriptor");
        Ok(())
    }

    fn clear(&self) -> Result<(), VmError> {
        remove_if_exists(&self.path)
    }
}

/// Region list cached to a file until an explicit `clean`.
#[derive(Debug, Clone)]
pub struct RegionCache {
    path: PathBuf,
}

impl RegionCache {
    /// Cache at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cached regions, if the cache file exists and parses.
    #[must_use]
    pub fn cached(&self) -> Option<Vec<String>> {
        read_json(&self.path).ok()
    }

    /// Cached regions, querying the provider and writing the cache on a miss.
    ///
    /// # Errors
    /// Returns an error if the provider query fails or the cache cannot be written.
    pub async fn get_or_fetch(
        &self,
        provider: &dyn ProviderAdapter,
        vm: &VmDescriptor,
    ) -> Result<Vec<String>, VmError> {
        if let Some(regions) = self.cached() {
            return Ok(regions);
        }
        let regions = provider.list_regions(vm).await?;
        write_json_atomic(&self.path, &regions)?;
        info!(count = regions.len(), path = %self.path.display(), "Cached region list");
        Ok(regions)
    }

    /// Delete the cache.
    ///
    /// # Errors
    /// Returns an error if the cache exists but cannot be removed.
    pub fn invalidate(&self) -> Result<(), VmError> {
        remove_if_exists(&self.path)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, VmError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), VmError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let content = serde_json::to_string_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| VmError::Io(e.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), VmError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
