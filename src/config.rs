//! Settings shared by every operation on a [crate::LayerService]

use crate::errors::LayerError;
use std::{
    env, fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Default bound on dialing the service VM
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

/// Default bound on each read or write once connected
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(120);

/// Default size of one payload copy
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default, and minimum, sandbox size in megabytes
pub const DEFAULT_SANDBOX_SIZE_MB: u64 = 16 * 1024;

/// Service endpoint the layer tool listens on inside the service VM
pub const LAYER_SERVICE_ID: &str = "e9447876-ba98-444f-8c14-6a2ffb62d5e3";

/// Tunables for the transport and storage layers
#[derive(Clone, Debug)]
pub struct Config {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub chunk_size: usize,
    pub default_sandbox_size_mb: u64,
    pub cache_dir: PathBuf,
    pub service_id: String,
}

impl Config {
    /// Default settings, with the cache directory chosen by
    /// [default_cache_dir()]
    pub fn new() -> Result<Self, LayerError> {
        Ok(Config::with_cache_dir(default_cache_dir()?))
    }

    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Config {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_sandbox_size_mb: DEFAULT_SANDBOX_SIZE_MB,
            cache_dir,
            service_id: LAYER_SERVICE_ID.to_string(),
        }
    }

    /// Directory for spooled input and partially written cache files
    pub fn temp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }
}

/// Determine a default per-user directory for the sandbox cache and spool
/// files.
///
/// Typically this returns `$HOME/.cache/svm-layers`, but it may return
/// `$XDG_CACHE_HOME/svm-layers` if the per-user cache directory has been
/// set, and the location can be customized directly via the
/// `$SVM_LAYERS_CACHE` environment variable.
pub fn default_cache_dir() -> Result<PathBuf, LayerError> {
    match env::var("SVM_LAYERS_CACHE") {
        Ok(s) => Ok(Path::new(&s).to_path_buf()),
        Err(_) => {
            let mut buf = match env::var("XDG_CACHE_HOME") {
                Ok(s) => Ok(Path::new(&s).to_path_buf()),
                Err(_) => match env::var("HOME") {
                    Ok(s) => Ok(Path::new(&s).join(".cache")),
                    Err(_) => Err(LayerError::NoDefaultCacheDir),
                },
            };
            if let Ok(buf) = &mut buf {
                buf.push("svm-layers");
            }
            buf
        }
    }
}

/// Where the identifier of the shared service VM comes from
///
/// A resolver is only called the first time the identifier is needed, and
/// its answer is kept by the [crate::LayerService] that owns it.
#[derive(Clone)]
pub enum VMIdSource {
    Fixed(String),
    Resolver(Arc<dyn Fn() -> io::Result<String> + Send + Sync>),
}

impl VMIdSource {
    pub fn resolve(&self) -> Result<String, LayerError> {
        match self {
            VMIdSource::Fixed(id) => Ok(id.clone()),
            VMIdSource::Resolver(resolver) => {
                resolver().map_err(|e| LayerError::ServiceVMResolve(e.to_string()))
            }
        }
    }
}

impl fmt::Debug for VMIdSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VMIdSource::Fixed(id) => f.debug_tuple("Fixed").field(id).finish(),
            VMIdSource::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}
