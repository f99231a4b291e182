//! Reference-counted map of service VM handles
//!
//! The registry lock only guards the shape of the map. Each handle's own
//! fields are guarded by the handle, so work against one VM never blocks
//! lookups of another, and no lock here is held across i/o.

use crate::{
    errors::VMError,
    vm::{lock, ServiceVM},
};
use std::{collections::HashMap, sync::Arc, sync::Mutex};

#[derive(Debug, Default)]
pub struct Registry {
    vms: Mutex<HashMap<String, Arc<ServiceVM>>>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Take a reference to the VM named `id`, creating its handle if needed
    ///
    /// Returns the handle and whether it already existed. A handle whose
    /// count already dropped to zero is being torn down and can't be
    /// revived; that fails with [VMError::Terminating].
    pub fn acquire(&self, id: &str) -> Result<(Arc<ServiceVM>, bool), VMError> {
        let mut vms = lock(&self.vms);
        match vms.get(id) {
            Some(vm) => {
                let refs = vm.add_ref()?;
                log::trace!("service VM {:?} acquired, {} refs", id, refs);
                Ok((vm.clone(), true))
            }
            None => {
                let vm = Arc::new(ServiceVM::new(id));
                vms.insert(id.to_string(), vm.clone());
                log::trace!("service VM {:?} registered", id);
                Ok((vm, false))
            }
        }
    }

    /// Drop a reference, returning true if it was the last one
    ///
    /// The handle stays registered until [Registry::delete()] removes it.
    pub fn release(&self, id: &str) -> Result<bool, VMError> {
        let vm = self.get(id).ok_or_else(|| VMError::UnknownVM(id.to_string()))?;
        let last = vm.drop_ref()?;
        log::trace!("service VM {:?} released, last={}", id, last);
        Ok(last)
    }

    /// Remove a handle whose reference count is zero
    pub fn delete(&self, id: &str) -> Result<(), VMError> {
        let mut vms = lock(&self.vms);
        let refs = vms
            .get(id)
            .ok_or_else(|| VMError::UnknownVM(id.to_string()))?
            .ref_count();
        if refs != 0 {
            return Err(VMError::StillReferenced {
                id: id.to_string(),
                refs,
            });
        }
        vms.remove(id);
        log::trace!("service VM {:?} removed", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceVM>> {
        lock(&self.vms).get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.vms).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.vms).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.vms).is_empty()
    }
}
