use super::{BoxStream, Dialer};
use futures_util::{future::BoxFuture, FutureExt};
use std::{collections::HashMap, io, net::SocketAddr};
use tokio::net::TcpStream;

/// Reaches service VMs through TCP, with one address per VM identifier
///
/// Useful when the VM's service endpoint is forwarded to a host port. The
/// service identifier is not part of the route; each address is assumed to
/// lead to the layer service already.
#[derive(Clone, Debug, Default)]
pub struct TcpDialer {
    routes: HashMap<String, SocketAddr>,
}

impl TcpDialer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn route(mut self, vm_id: &str, addr: SocketAddr) -> Self {
        self.routes.insert(vm_id.to_string(), addr);
        self
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, vm_id: &str, _service_id: &str) -> BoxFuture<'static, io::Result<BoxStream>> {
        let addr = self.routes.get(vm_id).copied();
        let vm_id = vm_id.to_string();
        async move {
            let addr = addr.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no route to service VM {:?}", vm_id),
                )
            })?;
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxStream)
        }
        .boxed()
    }
}
