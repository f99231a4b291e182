use super::{finish, LayerService, LayerStream, SANDBOX_FILENAME};
use crate::{errors::LayerError, protocol::Command, storage};
use std::path::Path;

impl LayerService {
    /// Provision a writable sandbox disk at `dest_file`
    ///
    /// Requests smaller than the default size are rounded up to it. A
    /// default-size sandbox is copied from the host-local cache when one is
    /// available, without contacting the service VM at all.
    pub async fn create_sandbox(
        &self,
        vm_id: &str,
        dest_file: &Path,
        max_size_mb: u64,
    ) -> Result<(), LayerError> {
        let size_mb = max_size_mb.max(self.config().default_sandbox_size_mb);
        let cached = self
            .sandbox_cache()
            .get_or_create(dest_file, size_mb, || {
                self.create_sandbox_uncached(vm_id, dest_file, size_mb)
            })
            .await?;
        log::info!(
            "created {} MB sandbox {:?}{}",
            size_mb,
            dest_file,
            if cached { " from cache" } else { "" }
        );
        Ok(())
    }

    async fn create_sandbox_uncached(
        &self,
        vm_id: &str,
        dest_file: &Path,
        size_mb: u64,
    ) -> Result<(), LayerError> {
        log::debug!("formatting new sandbox {:?} via service VM {:?}", dest_file, vm_id);
        storage::create_parent_dirs(dest_file).await;
        if let Err(err) = self.platform().create_disk(dest_file, size_mb).await {
            storage::discard(dest_file).await;
            return Err(err.into());
        }

        let result = self.format_sandbox(vm_id, dest_file).await;
        if result.is_err() {
            storage::discard(dest_file).await;
        }
        result
    }

    async fn format_sandbox(&self, vm_id: &str, dest_file: &Path) -> Result<(), LayerError> {
        let vm = self.acquire_vm(vm_id).await?;
        let disk = match self.attach_disk(vm.vm(), dest_file).await {
            Ok(disk) => disk,
            Err(err) => return finish(Err(err.into()), None, None, vm).await,
        };
        let mut conn = match self.connect(vm.id()).await {
            Ok(conn) => conn,
            Err(err) => return finish(Err(err), None, Some(disk), vm).await,
        };
        let result = async {
            conn.send_disk_request(Command::CreateSandbox, &disk.address())
                .await?;
            let len = conn.expect_ok(Command::CreateSandbox).await?;
            if len > 0 {
                log::debug!("ignoring {} byte payload after create-sandbox", len);
                conn.recv_payload(&mut tokio::io::sink(), len, self.config().chunk_size)
                    .await?;
            }
            Ok::<(), LayerError>(())
        }
        .await;
        finish(result, Some(conn), Some(disk), vm).await
    }

    /// Stream the contents of the sandbox in `<src_dir>/sandbox.vhdx` as a
    /// tar archive
    ///
    /// The sandbox stays attached to the service VM until the returned
    /// stream has been read to its end or finished.
    pub async fn export_sandbox_layer(
        &self,
        vm_id: &str,
        src_dir: &Path,
    ) -> Result<LayerStream, LayerError> {
        let src = src_dir.join(SANDBOX_FILENAME);
        log::debug!("export sandbox {:?} via service VM {:?}", src, vm_id);
        tokio::fs::metadata(&src).await?;
        let chunk_size = self.config().chunk_size;

        let vm = self.acquire_vm(vm_id).await?;
        let disk = match self.attach_disk(vm.vm(), &src).await {
            Ok(disk) => disk,
            Err(err) => return finish(Err(err.into()), None, None, vm).await,
        };
        let mut conn = match self.connect(vm.id()).await {
            Ok(conn) => conn,
            Err(err) => return finish(Err(err), None, Some(disk), vm).await,
        };
        let response = async {
            conn.send_disk_request(Command::ExportSandbox, &disk.address())
                .await?;
            conn.expect_ok(Command::ExportSandbox).await
        }
        .await;
        let len = match response {
            Ok(len) => len,
            Err(err) => return finish(Err(err), Some(conn), Some(disk), vm).await,
        };

        Ok(LayerStream::spawn(chunk_size, move |mut pipe| async move {
            let result = conn.recv_payload(&mut pipe, len, chunk_size).await;
            drop(pipe);
            if let Ok(copied) = &result {
                log::info!("exported sandbox {:?} as {} byte tar", src, copied);
            }
            finish(result, Some(conn), Some(disk), vm).await
        }))
    }
}
