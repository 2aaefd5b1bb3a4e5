//! Region lifecycle: create, open, poison, unlink.

use std::fs::{self, OpenOptions};
use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::MmapMut;
use thiserror::Error;

use crate::region::{SharedRegion, REGION_SIZE};
use crate::{SHARED_MAGIC, SHARED_VERSION};

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared region i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared region is {found} bytes, expected {expected}")]
    BadSize { found: u64, expected: u64 },

    #[error("shared region magic {0:#010x} (engine not running, or stopped)")]
    BadMagic(u32),

    #[error("shared region layout version {found}, this build speaks {expected}")]
    BadVersion { found: u32, expected: u32 },
}

/// An owned or borrowed mapping of the shared region.
///
/// The engine creates the region (`create`) and keeps the value alive for
/// the whole session; dropping the creator poisons the magic and unlinks
/// the file. Consumers `open` an existing region and never unlink.
pub struct RegionMap {
    map: MmapMut,
    path: PathBuf,
    owner: bool,
}

impl RegionMap {
    /// Create the region file, size it, map it and stamp the header. The
    /// magic is stored last with release ordering so a consumer that sees
    /// it also sees the version and session id.
    pub fn create(path: &Path) -> Result<Self, ShmError> {
        // A leftover file from a crashed engine is stale by definition.
        let _ = fs::remove_file(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(REGION_SIZE as u64)?;
        // Consumers run as other users; the region is deliberately open.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o666))?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };

        let this = Self {
            map,
            path: path.to_owned(),
            owner: true,
        };
        let region = this.region();
        region.version.store(SHARED_VERSION, Ordering::Relaxed);
        region
            .session_id
            .store(random_session_id(), Ordering::Relaxed);
        region.magic.store(SHARED_MAGIC, Ordering::Release);
        log::info!(
            "shared region created at {} ({} bytes, session {:#010x})",
            path.display(),
            REGION_SIZE,
            region.session_id.load(Ordering::Relaxed)
        );
        Ok(this)
    }

    /// Map an existing region and validate size, magic and version.
    pub fn open(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != REGION_SIZE as u64 {
            return Err(ShmError::BadSize {
                found: len,
                expected: REGION_SIZE as u64,
            });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let this = Self {
            map,
            path: path.to_owned(),
            owner: false,
        };
        let region = this.region();
        let magic = region.magic.load(Ordering::Acquire);
        if magic != SHARED_MAGIC {
            return Err(ShmError::BadMagic(magic));
        }
        let version = region.version.load(Ordering::Relaxed);
        if version != SHARED_VERSION {
            return Err(ShmError::BadVersion {
                found: version,
                expected: SHARED_VERSION,
            });
        }
        Ok(this)
    }

    pub fn region(&self) -> &SharedRegion {
        debug_assert_eq!(self.map.as_ptr() as usize % 64, 0);
        unsafe { &*(self.map.as_ptr() as *const SharedRegion) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the region dead for every mapped consumer.
    pub fn poison(&self) {
        self.region().magic.store(0, Ordering::Release);
    }
}

impl Drop for RegionMap {
    fn drop(&mut self) {
        if self.owner {
            self.poison();
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// One fresh 32-bit token per engine start. OS-seeded hasher state mixed
/// with the clock and pid; never zero so "no session" stays representable.
fn random_session_id() -> u32 {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    hasher.write_u128(now.as_nanos());
    hasher.write_u32(std::process::id());
    let id = hasher.finish() as u32;
    if id == 0 {
        1
    } else {
        id
    }
}
