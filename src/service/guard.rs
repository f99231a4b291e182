//! Scoped ownership of service VM references and disk attachments
//!
//! Both guards are released explicitly with an async `release()`. If one is
//! dropped while still armed, as happens when a task is cancelled, the
//! release is handed to a background task on the current runtime.

use super::LayerService;
use crate::{
    errors::{DiskError, VMError},
    protocol::ScsiAddress,
    vm::ServiceVM,
};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::runtime::Handle;

/// One counted reference to a registered service VM
pub(crate) struct VMRef {
    service: LayerService,
    vm: Arc<ServiceVM>,
    armed: bool,
}

impl VMRef {
    pub(crate) fn new(service: LayerService, vm: Arc<ServiceVM>) -> Self {
        VMRef {
            service,
            vm,
            armed: true,
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.vm.id()
    }

    pub(crate) fn vm(&self) -> &Arc<ServiceVM> {
        &self.vm
    }

    pub(crate) async fn release(mut self) -> Result<(), VMError> {
        self.armed = false;
        self.service.release_vm(&self.vm).await
    }

    /// Leave the reference held with no guard responsible for it
    pub(crate) fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for VMRef {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("service VM {:?} reference dropped without release", self.vm.id());
        let service = self.service.clone();
        let vm = self.vm.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = service.release_vm(&vm).await {
                        log::warn!("deferred release of service VM {:?} failed, {}", vm.id(), err);
                    }
                });
            }
            Err(_) => log::error!("no runtime to release service VM {:?}, reference leaked", vm.id()),
        }
    }
}

/// A disk hot-plugged for the duration of one operation
///
/// Must be released exactly once; a leaked attachment keeps its SCSI slot
/// occupied.
pub struct DiskAttachment {
    service: LayerService,
    vm: Arc<ServiceVM>,
    path: PathBuf,
    address: ScsiAddress,
    armed: bool,
}

impl fmt::Debug for DiskAttachment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DiskAttachment")
            .field("vm", &self.vm.id())
            .field("path", &self.path)
            .field("address", &self.address)
            .finish()
    }
}

impl DiskAttachment {
    pub(crate) fn new(
        service: LayerService,
        vm: Arc<ServiceVM>,
        path: &Path,
        address: ScsiAddress,
    ) -> Self {
        DiskAttachment {
            service,
            vm,
            path: path.to_path_buf(),
            address,
            armed: true,
        }
    }

    pub fn address(&self) -> ScsiAddress {
        self.address
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) -> Result<(), DiskError> {
        self.armed = false;
        self.vm
            .hot_remove_disk(self.service.platform(), &self.path)
            .await
    }
}

impl Drop for DiskAttachment {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("disk {:?} dropped without release", self.path);
        let service = self.service.clone();
        let vm = self.vm.clone();
        let path = self.path.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = vm.hot_remove_disk(service.platform(), &path).await {
                        log::warn!("deferred detach of {:?} failed, {}", path, err);
                    }
                });
            }
            Err(_) => log::error!("no runtime to detach {:?}, SCSI slot leaked", path),
        }
    }
}
