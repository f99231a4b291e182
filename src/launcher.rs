//! Starting and stopping the service VM itself

use futures_util::{future::BoxFuture, FutureExt};
use std::io;

/// Mechanism that brings a service VM up and down
///
/// Called by [crate::LayerService] when the first reference to a VM is
/// taken and after the last one is released.
pub trait VMLauncher: Send + Sync {
    fn start(&self, vm_id: &str) -> BoxFuture<'static, io::Result<()>>;
    fn stop(&self, vm_id: &str) -> BoxFuture<'static, io::Result<()>>;
}

/// Service VMs whose lifecycle is managed by someone else
///
/// Start and stop succeed immediately; the VM is assumed to be reachable
/// whenever it is referenced.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExternalVM;

impl VMLauncher for ExternalVM {
    fn start(&self, vm_id: &str) -> BoxFuture<'static, io::Result<()>> {
        log::trace!("service VM {:?} is managed externally", vm_id);
        async { Ok(()) }.boxed()
    }

    fn stop(&self, _vm_id: &str) -> BoxFuture<'static, io::Result<()>> {
        async { Ok(()) }.boxed()
    }
}
