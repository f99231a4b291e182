use super::{finish, LayerService, LayerStream, LAYER_FILENAME};
use crate::{errors::LayerError, protocol::Command};
use std::path::Path;
use tokio::fs::File;

impl LayerService {
    /// Convert the layer in `<src_dir>/layer.vhd` back into a tar stream
    ///
    /// The request is sent and the response header checked before this
    /// returns, so a refusal from the service VM is reported here. The tar
    /// bytes themselves are streamed through the returned [LayerStream].
    pub async fn export_layer(&self, vm_id: &str, src_dir: &Path) -> Result<LayerStream, LayerError> {
        let src = src_dir.join(LAYER_FILENAME);
        log::debug!("export layer {:?} via service VM {:?}", src, vm_id);
        let mut file = File::open(&src).await?;
        let size = file.metadata().await?.len();
        let chunk_size = self.config().chunk_size;

        let vm = self.acquire_vm(vm_id).await?;
        let mut conn = match self.connect(vm.id()).await {
            Ok(conn) => conn,
            Err(err) => return finish(Err(err), None, None, vm).await,
        };
        let response = async {
            conn.send_request(Command::Export, &mut file, size, chunk_size)
                .await?;
            conn.expect_ok(Command::Export).await
        }
        .await;
        let len = match response {
            Ok(len) => len,
            Err(err) => return finish(Err(err), Some(conn), None, vm).await,
        };

        Ok(LayerStream::spawn(chunk_size, move |mut pipe| async move {
            let result = conn.recv_payload(&mut pipe, len, chunk_size).await;
            drop(pipe);
            if let Ok(copied) = &result {
                log::info!("exported {:?} as {} byte tar", src, copied);
            }
            finish(result, Some(conn), None, vm).await
        }))
    }
}
