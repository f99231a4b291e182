//! Hot-plugging virtual disks onto a service VM's SCSI bus
//!
//! The physical attach and detach are performed by a [DiskPlatform]. This
//! module keeps the per-path attach counts that let concurrent operations
//! share one attached disk, so the platform is only invoked on the first
//! attach and the last detach of a path.

mod command;

pub use command::CommandPlatform;

use crate::{errors::DiskError, protocol::ScsiAddress};
use futures_util::future::BoxFuture;
use regex::Regex;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

/// Host primitives for creating and hot-plugging virtual disk files
pub trait DiskPlatform: Send + Sync {
    /// Create an empty virtual disk file of `size_mb` megabytes
    fn create_disk(&self, path: &Path, size_mb: u64) -> BoxFuture<'static, io::Result<()>>;

    /// Hot-add `path` to the VM, returning a human-readable description
    /// which contains `SCSI <controller> <location>`
    fn attach(&self, vm_id: &str, path: &Path) -> BoxFuture<'static, io::Result<String>>;

    /// Hot-remove whatever disk is at `address`
    fn detach(&self, vm_id: &str, address: ScsiAddress) -> BoxFuture<'static, io::Result<()>>;
}

/// Find the bus address in an attach description
pub fn parse_scsi_address(description: &str) -> Result<ScsiAddress, DiskError> {
    lazy_static! {
        static ref SCSI: Regex = Regex::new(r"SCSI\s+(\d+)\s+(\d+)").unwrap();
    }
    let captures = SCSI
        .captures(description)
        .ok_or_else(|| DiskError::UnparsableAddress(description.to_string()))?;
    let field = |idx: usize| {
        captures[idx]
            .parse::<u32>()
            .map_err(|_| DiskError::UnparsableAddress(description.to_string()))
    };
    let address = ScsiAddress::new(field(1)?, field(2)?);
    if address.is_valid_slot() {
        Ok(address)
    } else {
        Err(DiskError::AddressOutOfRange(address))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct AttachRecord {
    address: ScsiAddress,
    refs: usize,
}

/// Attach counts for one service VM, keyed by host path
///
/// A path is present exactly while its disk is physically attached.
#[derive(Debug, Default)]
pub struct AttachedDisks {
    by_path: HashMap<PathBuf, AttachRecord>,
}

impl AttachedDisks {
    pub fn new() -> Self {
        Default::default()
    }

    /// Share an existing attachment, if there is one
    pub fn add_ref(&mut self, path: &Path) -> Option<ScsiAddress> {
        let record = self.by_path.get_mut(path)?;
        record.refs += 1;
        Some(record.address)
    }

    /// Record a fresh physical attach with one reference
    pub fn insert(&mut self, path: &Path, address: ScsiAddress) {
        let previous = self.by_path.insert(
            path.to_path_buf(),
            AttachRecord { address, refs: 1 },
        );
        debug_assert!(previous.is_none());
    }

    /// Drop one reference. Returns the address if the caller must now
    /// physically detach it, or None if other references remain.
    pub fn release(&mut self, path: &Path) -> Result<Option<ScsiAddress>, DiskError> {
        let record = self
            .by_path
            .get_mut(path)
            .ok_or_else(|| DiskError::NotAttached(path.to_path_buf()))?;
        record.refs -= 1;
        if record.refs == 0 {
            let address = record.address;
            self.by_path.remove(path);
            Ok(Some(address))
        } else {
            Ok(None)
        }
    }

    pub fn address(&self, path: &Path) -> Option<ScsiAddress> {
        self.by_path.get(path).map(|record| record.address)
    }

    pub fn refs(&self, path: &Path) -> usize {
        self.by_path.get(path).map_or(0, |record| record.refs)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
