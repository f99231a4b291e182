//! Mutable state for one service VM
//!
//! Reference counts and lifecycle flags sit behind a short-lived lock that
//! is never held across an await. Disk attach bookkeeping has its own async
//! lock, held across the platform call on a 0->1 or 1->0 transition so that
//! two operations sharing a path can't both attach or both detach it.

use crate::{
    disk::{parse_scsi_address, AttachedDisks, DiskPlatform},
    errors::{DiskError, VMError},
    protocol::ScsiAddress,
    refcount::RefCounts,
    signal::Completion,
};
use std::{
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

#[derive(Debug)]
struct Lifecycle {
    ref_count: usize,
    scratch_attached: bool,
}

/// Handle for one service VM, shared by every operation using it
#[derive(Debug)]
pub struct ServiceVM {
    id: String,
    lifecycle: Mutex<Lifecycle>,
    union_mounts: Mutex<RefCounts<String>>,
    disks: tokio::sync::Mutex<AttachedDisks>,
    started: Completion,
    stopped: Completion,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceVM {
    /// New handle holding the one reference of its creator
    pub(crate) fn new(id: &str) -> Self {
        ServiceVM {
            id: id.to_string(),
            lifecycle: Mutex::new(Lifecycle {
                ref_count: 1,
                scratch_attached: false,
            }),
            union_mounts: Mutex::new(RefCounts::new()),
            disks: tokio::sync::Mutex::new(AttachedDisks::new()),
            started: Completion::new(),
            stopped: Completion::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ref_count(&self) -> usize {
        lock(&self.lifecycle).ref_count
    }

    /// Add a reference unless the count already reached zero
    pub(crate) fn add_ref(&self) -> Result<usize, VMError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.ref_count == 0 {
            Err(VMError::Terminating(self.id.clone()))
        } else {
            lifecycle.ref_count += 1;
            Ok(lifecycle.ref_count)
        }
    }

    /// Drop a reference, returning true if it was the last one
    pub(crate) fn drop_ref(&self) -> Result<bool, VMError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.ref_count == 0 {
            Err(VMError::RefCountUnderflow(self.id.clone()))
        } else {
            lifecycle.ref_count -= 1;
            Ok(lifecycle.ref_count == 0)
        }
    }

    pub fn signal_started(&self, result: Result<(), VMError>) {
        if !self.started.signal(result) {
            log::debug!("service VM {:?} start already signalled", self.id);
        }
    }

    pub fn signal_stopped(&self, result: Result<(), VMError>) {
        if !self.stopped.signal(result) {
            log::debug!("service VM {:?} stop already signalled", self.id);
        }
    }

    /// Wait for the VM to finish starting and return the start result
    pub async fn await_started(&self) -> Result<(), VMError> {
        self.started.wait().await
    }

    /// Wait for the VM to finish stopping and return the stop result
    pub async fn await_stopped(&self) -> Result<(), VMError> {
        self.stopped.wait().await
    }

    /// Start result, if the start signal has fired
    pub fn start_result(&self) -> Option<Result<(), VMError>> {
        self.started.peek()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_signalled()
    }

    pub fn set_scratch_attached(&self, attached: bool) {
        lock(&self.lifecycle).scratch_attached = attached;
    }

    pub fn scratch_attached(&self) -> bool {
        lock(&self.lifecycle).scratch_attached
    }

    /// Count a union mount, returning true if the caller must perform the
    /// physical mount
    pub fn add_union_mount(&self, name: &str) -> bool {
        lock(&self.union_mounts).acquire(name.to_string())
    }

    /// Release a union mount, returning true if the caller must perform the
    /// physical unmount
    pub fn remove_union_mount(&self, name: &str) -> Result<bool, VMError> {
        lock(&self.union_mounts)
            .release(name)
            .ok_or_else(|| VMError::NotMounted(name.to_string()))
    }

    pub fn union_mount_count(&self, name: &str) -> usize {
        lock(&self.union_mounts).count(name)
    }

    /// Attach `path` to this VM, or share an existing attachment of it
    ///
    /// Waits for the VM to finish starting first.
    pub async fn hot_add_disk(
        &self,
        platform: &dyn DiskPlatform,
        path: &Path,
    ) -> Result<ScsiAddress, DiskError> {
        self.await_started().await?;
        let mut disks = self.disks.lock().await;
        if let Some(address) = disks.add_ref(path) {
            log::debug!(
                "sharing {:?} on service VM {:?} at {}, {} refs",
                path,
                self.id,
                address,
                disks.refs(path)
            );
            return Ok(address);
        }
        let description = platform.attach(&self.id, path).await?;
        let address = parse_scsi_address(&description)?;
        disks.insert(path, address);
        log::info!("attached {:?} to service VM {:?} at {}", path, self.id, address);
        Ok(address)
    }

    /// Release one attach of `path`, detaching it when no references remain
    ///
    /// If the physical detach fails the attachment is kept, with one
    /// reference, so its bus slot is never forgotten while still occupied.
    pub async fn hot_remove_disk(
        &self,
        platform: &dyn DiskPlatform,
        path: &Path,
    ) -> Result<(), DiskError> {
        self.await_started().await?;
        let mut disks = self.disks.lock().await;
        if let Some(address) = disks.release(path)? {
            if let Err(err) = platform.detach(&self.id, address).await {
                disks.insert(path, address);
                return Err(err.into());
            }
            log::info!("detached {:?} from service VM {:?} at {}", path, self.id, address);
        }
        Ok(())
    }

    pub async fn disk_address(&self, path: &Path) -> Option<ScsiAddress> {
        self.disks.lock().await.address(path)
    }

    pub async fn disk_refs(&self, path: &Path) -> usize {
        self.disks.lock().await.refs(path)
    }

    pub async fn attached_disk_count(&self) -> usize {
        self.disks.lock().await.len()
    }
}
