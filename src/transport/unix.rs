use super::{BoxStream, Dialer};
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::net::UnixStream;

/// Reaches service VMs through Unix sockets laid out as
/// `<dir>/<vm_id>/<service_id>`
#[derive(Clone, Debug)]
pub struct UnixDialer {
    dir: PathBuf,
}

impl UnixDialer {
    pub fn new(dir: &Path) -> Self {
        UnixDialer {
            dir: dir.to_path_buf(),
        }
    }

    pub fn socket_path(&self, vm_id: &str, service_id: &str) -> PathBuf {
        self.dir.join(vm_id).join(service_id)
    }
}

impl Dialer for UnixDialer {
    fn dial(&self, vm_id: &str, service_id: &str) -> BoxFuture<'static, io::Result<BoxStream>> {
        let path = self.socket_path(vm_id, service_id);
        async move {
            let stream = UnixStream::connect(&path).await?;
            Ok(Box::new(stream) as BoxStream)
        }
        .boxed()
    }
}
