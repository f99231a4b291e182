//! Host-local copy of one default-size sandbox disk
//!
//! The first default-size sandbox is created by the service VM and copied
//! here; later default-size requests copy this file instead of making a
//! round trip. Population and lookup are serialized so that concurrent
//! requests never observe a half-written cache file.

use crate::{errors::LayerError, storage};
use std::{
    future::Future,
    path::{Path, PathBuf},
};
use tokio::{fs, io, sync::Mutex};

#[derive(Debug)]
pub struct SandboxCache {
    path: PathBuf,
    temp_dir: PathBuf,
    size_mb: u64,
    lock: Mutex<()>,
}

impl SandboxCache {
    pub fn new(cache_dir: &Path, temp_dir: &Path, size_mb: u64) -> Self {
        SandboxCache {
            path: cache_dir.join(format!("sandbox-{}mb.vhdx", size_mb)),
            temp_dir: temp_dir.to_path_buf(),
            size_mb,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_mb(&self) -> u64 {
        self.size_mb
    }

    pub async fn is_populated(&self) -> bool {
        match fs::metadata(&self.path).await {
            Ok(metadata) => metadata.is_file(),
            Err(_) => false,
        }
    }

    /// Produce a sandbox of `size_mb` at `dest`, from the cache if possible
    ///
    /// `create` builds the sandbox at `dest` when the cache can't be used.
    /// Returns true if the sandbox came from the cache.
    pub async fn get_or_create<F, Fut>(
        &self,
        dest: &Path,
        size_mb: u64,
        create: F,
    ) -> Result<bool, LayerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), LayerError>>,
    {
        if size_mb != self.size_mb {
            create().await?;
            return Ok(false);
        }

        let _guard = self.lock.lock().await;
        if self.is_populated().await {
            log::debug!("sandbox cache hit, copying {:?} to {:?}", self.path, dest);
            storage::create_parent_dirs(dest).await;
            fs::copy(&self.path, dest).await?;
            return Ok(true);
        }

        create().await?;
        if let Err(err) = self.populate(dest).await {
            log::warn!("failed to populate sandbox cache from {:?}, {:?}", dest, err);
        }
        Ok(false)
    }

    async fn populate(&self, source: &Path) -> io::Result<()> {
        let mut temp = storage::TempFile::create(&self.temp_dir).await?;
        let mut input = fs::File::open(source).await?;
        io::copy(&mut input, temp.file_mut()).await?;
        temp.persist(&self.path).await?;
        log::info!("sandbox cache populated at {:?}", self.path);
        Ok(())
    }
}
