//! Local scratch files: spooled request payloads and cache temporaries

use std::{
    fs as std_fs, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs,
    fs::{File, OpenOptions},
    io::{AsyncRead, AsyncSeekExt, AsyncWriteExt, SeekFrom},
};

pub fn temp_path(dir: &Path) -> PathBuf {
    let mut path = dir.join(format!("{}-{}", std::process::id(), rand::random::<u64>()));
    path.set_extension("tmp");
    path
}

pub async fn create_parent_dirs(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent).await {
            // Log a warning instead of giving up right away, in case this was a race
            // condition.
            log::warn!("error creating directory at {:?}, {:?}", parent, err);
        }
    }
}

/// Remove a file that is no longer wanted, logging rather than failing
pub async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => log::debug!("discarded {:?}", path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => (),
        Err(err) => log::warn!("failed to discard {:?}, {:?}", path, err),
    }
}

/// A file in the temp directory, deleted on drop unless persisted
#[derive(Debug)]
pub struct TempFile {
    file: File,
    path: Option<PathBuf>,
}

impl TempFile {
    pub async fn create(dir: &Path) -> io::Result<TempFile> {
        let path = temp_path(dir);
        create_parent_dirs(&path).await;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(TempFile {
            file,
            path: Some(path),
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush and move the file to `dest`, replacing anything already there
    pub async fn persist(mut self, dest: &Path) -> io::Result<()> {
        self.file.sync_all().await?;
        if let Some(path) = self.path.take() {
            create_parent_dirs(dest).await;
            if let Err(err) = fs::rename(&path, dest).await {
                self.path = Some(path);
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std_fs::remove_file(&path) {
                log::warn!("failed to remove temp file {:?}, {:?}", path, err);
            }
        }
    }
}

/// Copy a stream of unknown length into a temp file, so its size can be
/// sent ahead of it. Returns the file rewound to the start, and its size.
pub async fn spool<R: AsyncRead + Unpin>(mut input: R, dir: &Path) -> io::Result<(TempFile, u64)> {
    let mut temp = TempFile::create(dir).await?;
    let size = tokio::io::copy(&mut input, temp.file_mut()).await?;
    temp.file.flush().await?;
    temp.file.seek(SeekFrom::Start(0)).await?;
    log::trace!("spooled {} bytes to {:?}", size, temp.path);
    Ok((temp, size))
}
