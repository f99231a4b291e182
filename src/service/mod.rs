//! Import, export and sandbox operations against service VMs

mod builder;
mod export;
mod guard;
mod import;
mod sandbox;
mod stream;

pub use builder::ServiceBuilder;
pub use guard::DiskAttachment;
pub use stream::LayerStream;

use crate::{
    cache::SandboxCache,
    config::{Config, VMIdSource},
    disk::DiskPlatform,
    errors::{DiskError, LayerError, VMError},
    launcher::VMLauncher,
    registry::Registry,
    transport::{self, Connection, Dialer},
    vm::ServiceVM,
};
use guard::VMRef;
use std::{fmt, path::Path, sync::Arc};
use tokio::sync::OnceCell;

/// Name of the virtual disk holding a read-only layer inside its directory
pub const LAYER_FILENAME: &str = "layer.vhd";

/// Name of the virtual disk holding a writable sandbox inside its directory
pub const SANDBOX_FILENAME: &str = "sandbox.vhdx";

/// Entry point for layer operations
///
/// Owns the registry of service VMs and the injected collaborators used to
/// reach them. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LayerService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    registry: Registry,
    cache: SandboxCache,
    dialer: Arc<dyn Dialer>,
    platform: Arc<dyn DiskPlatform>,
    launcher: Arc<dyn VMLauncher>,
    service_vm: Option<VMIdSource>,
    service_vm_id: OnceCell<String>,
}

impl fmt::Debug for LayerService {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LayerService")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("service_vm", &self.inner.service_vm)
            .finish()
    }
}

impl LayerService {
    /// Construct a service with custom collaborators and options
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn sandbox_cache(&self) -> &SandboxCache {
        &self.inner.cache
    }

    pub(crate) fn platform(&self) -> &dyn DiskPlatform {
        &*self.inner.platform
    }

    /// Identifier of the shared service VM
    ///
    /// Resolved on first use and remembered for the life of this service.
    pub async fn service_vm_id(&self) -> Result<&str, LayerError> {
        let source = self
            .inner
            .service_vm
            .as_ref()
            .ok_or(LayerError::NoServiceVM)?;
        let id = self
            .inner
            .service_vm_id
            .get_or_try_init(|| async { source.resolve() })
            .await?;
        Ok(id.as_str())
    }

    /// Hold a long-lived reference to a service VM, starting it if needed
    ///
    /// The VM keeps running across operations until a matching
    /// [LayerService::stop_service_vm()].
    pub async fn start_service_vm(&self, vm_id: &str) -> Result<(), LayerError> {
        self.acquire_vm(vm_id).await?.keep();
        Ok(())
    }

    /// Drop a reference taken by [LayerService::start_service_vm()],
    /// stopping the VM if no operations are still using it
    pub async fn stop_service_vm(&self, vm_id: &str) -> Result<(), LayerError> {
        let vm = self
            .inner
            .registry
            .get(vm_id)
            .ok_or_else(|| VMError::UnknownVM(vm_id.to_string()))?;
        self.release_vm(&vm).await?;
        Ok(())
    }

    /// Open a connection to the layer service inside `vm_id`
    pub async fn connect(&self, vm_id: &str) -> Result<Connection, LayerError> {
        let config = &self.inner.config;
        Ok(transport::connect(
            &*self.inner.dialer,
            vm_id,
            &config.service_id,
            config.connect_timeout,
            config.io_timeout,
        )
        .await?)
    }

    /// Take a reference to `vm_id`, launching it if this is the first one,
    /// and wait until it has started
    async fn acquire_vm(&self, vm_id: &str) -> Result<VMRef, LayerError> {
        let (vm, existed) = self.inner.registry.acquire(vm_id)?;
        let vm_ref = VMRef::new(self.clone(), vm.clone());
        if !existed {
            log::info!("starting service VM {:?}", vm_id);
            let result = self
                .inner
                .launcher
                .start(vm_id)
                .await
                .map_err(|e| VMError::StartFailed(e.to_string()));
            vm.signal_started(result);
        }
        match vm.await_started().await {
            Ok(()) => Ok(vm_ref),
            Err(err) => unwind(Err(err.into()), vm_ref.release().await),
        }
    }

    /// Release one reference; the last one stops the VM and unregisters it
    async fn release_vm(&self, vm: &Arc<ServiceVM>) -> Result<(), VMError> {
        if !self.inner.registry.release(vm.id())? {
            return Ok(());
        }
        let result = match vm.start_result() {
            Some(Ok(())) => {
                log::info!("stopping service VM {:?}", vm.id());
                self.inner
                    .launcher
                    .stop(vm.id())
                    .await
                    .map_err(|e| VMError::StopFailed(e.to_string()))
            }
            _ => Ok(()),
        };
        vm.signal_stopped(result.clone());
        self.inner.registry.delete(vm.id())?;
        result
    }

    /// Hot-add `path` to `vm`, returning a guard that must be released
    async fn attach_disk(
        &self,
        vm: &Arc<ServiceVM>,
        path: &Path,
    ) -> Result<DiskAttachment, DiskError> {
        let address = vm.hot_add_disk(self.platform(), path).await?;
        Ok(DiskAttachment::new(self.clone(), vm.clone(), path, address))
    }
}

/// Combine an operation's result with the result of a cleanup step
///
/// The operation's own error always wins; a cleanup failure while already
/// unwinding is logged and dropped.
pub(crate) fn unwind<T, E>(result: Result<T, LayerError>, cleanup: Result<(), E>) -> Result<T, LayerError>
where
    E: Into<LayerError>,
{
    match (result, cleanup) {
        (result, Ok(())) => result,
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), Err(cleanup_err)) => {
            let cleanup_err: LayerError = cleanup_err.into();
            log::warn!("cleanup failed after error, {}", cleanup_err);
            Err(err)
        }
    }
}

/// Release every resource an operation holds, newest first
async fn finish<T>(
    result: Result<T, LayerError>,
    conn: Option<Connection>,
    disk: Option<DiskAttachment>,
    vm: VMRef,
) -> Result<T, LayerError> {
    let mut result = result;
    if let Some(conn) = conn {
        result = unwind(result, conn.close().await);
    }
    if let Some(disk) = disk {
        result = unwind(result, disk.release().await);
    }
    unwind(result, vm.release().await)
}
