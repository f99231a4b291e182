use super::{unwind, LayerService, LAYER_FILENAME};
use crate::{errors::LayerError, protocol::Command, storage};
use std::path::Path;
use tokio::{
    fs::{self, File},
    io::AsyncRead,
};

impl LayerService {
    /// Convert a tar stream into a virtual disk layer
    ///
    /// The service VM builds the disk and sends it back; it is written to
    /// `<dest_dir>/layer.vhd`. The input is spooled to a temp file first,
    /// since the request header carries the payload size up front. Returns
    /// the number of bytes written to the layer file.
    ///
    /// Not atomic: on error, the partially written layer file is removed.
    pub async fn import_layer<R>(
        &self,
        vm_id: &str,
        dest_dir: &Path,
        tar: R,
    ) -> Result<u64, LayerError>
    where
        R: AsyncRead + Unpin,
    {
        log::debug!("import layer to {:?} via service VM {:?}", dest_dir, vm_id);
        let (mut spool, size) = storage::spool(tar, &self.config().temp_dir()).await?;
        fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(LAYER_FILENAME);

        let vm = self.acquire_vm(vm_id).await?;
        let result = self.import_session(vm.id(), spool.file_mut(), size, &dest).await;
        let result = unwind(result, vm.release().await);

        match &result {
            Ok(written) => log::info!("imported {} byte tar as {} byte layer {:?}", size, written, dest),
            Err(err) => {
                log::debug!("import to {:?} failed, {}", dest, err);
                storage::discard(&dest).await;
            }
        }
        result
    }

    async fn import_session(
        &self,
        vm_id: &str,
        tar: &mut File,
        size: u64,
        dest: &Path,
    ) -> Result<u64, LayerError> {
        let chunk_size = self.config().chunk_size;
        let mut conn = self.connect(vm_id).await?;
        let result = async {
            conn.send_request(Command::Import, tar, size, chunk_size)
                .await?;
            let len = conn.expect_ok(Command::Import).await?;
            let mut file = File::create(dest).await?;
            let written = conn.recv_payload(&mut file, len, chunk_size).await?;
            file.sync_all().await?;
            Ok::<u64, LayerError>(written)
        }
        .await;
        unwind(result, conn.close().await)
    }
}
