use super::{Inner, LayerService};
use crate::{
    cache::SandboxCache,
    config::{default_cache_dir, Config, VMIdSource},
    disk::DiskPlatform,
    errors::LayerError,
    launcher::{ExternalVM, VMLauncher},
    registry::Registry,
    transport::Dialer,
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::OnceCell;

/// Builder for configuring custom [LayerService] instances
///
/// A [Dialer] and a [DiskPlatform] are required. Without a [VMLauncher],
/// service VMs are assumed to be managed outside this process.
pub struct ServiceBuilder {
    dialer: Option<Arc<dyn Dialer>>,
    platform: Option<Arc<dyn DiskPlatform>>,
    launcher: Arc<dyn VMLauncher>,
    connect_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
    chunk_size: Option<usize>,
    default_sandbox_size_mb: Option<u64>,
    cache_dir: Option<PathBuf>,
    service_vm: Option<VMIdSource>,
}

impl ServiceBuilder {
    /// Start constructing a custom layer service
    pub fn new() -> Self {
        ServiceBuilder {
            dialer: None,
            platform: None,
            launcher: Arc::new(ExternalVM),
            connect_timeout: None,
            io_timeout: None,
            chunk_size: None,
            default_sandbox_size_mb: None,
            cache_dir: None,
            service_vm: None,
        }
    }

    /// Set how connections to the layer service inside a VM are opened
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Set the host primitives used to create and hot-plug virtual disks
    pub fn disk_platform(mut self, platform: Arc<dyn DiskPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Start and stop service VMs on first and last reference
    pub fn launcher(mut self, launcher: Arc<dyn VMLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Set a timeout for dialing the service VM
    ///
    /// The default is [crate::config::DEFAULT_CONNECT_TIMEOUT]. A dial still
    /// running when this expires is abandoned.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set a timeout for each individual read or write once connected
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Set the largest piece of payload copied at once
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    /// Change the default, and minimum, sandbox size
    ///
    /// Only sandboxes of exactly this size are served from the cache.
    pub fn default_sandbox_size_mb(mut self, size_mb: u64) -> Self {
        self.default_sandbox_size_mb = Some(size_mb);
        self
    }

    /// Change the cache directory
    ///
    /// This holds the cached default-size sandbox and temporary spool files.
    /// The default directory can be determined with [default_cache_dir()].
    pub fn cache_dir(mut self, dir: &Path) -> Self {
        self.cache_dir = Some(dir.to_path_buf());
        self
    }

    /// Name the shared service VM
    pub fn service_vm_id(mut self, id: String) -> Self {
        self.service_vm = Some(VMIdSource::Fixed(id));
        self
    }

    /// Find the shared service VM with a callback, the first time it's
    /// needed
    pub fn service_vm_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn() -> io::Result<String> + Send + Sync + 'static,
    {
        self.service_vm = Some(VMIdSource::Resolver(Arc::new(resolver)));
        self
    }

    /// Construct a LayerService using the parameters from this Builder
    pub fn build(self) -> Result<LayerService, LayerError> {
        let dialer = self.dialer.ok_or(LayerError::MissingCollaborator("dialer"))?;
        let platform = self
            .platform
            .ok_or(LayerError::MissingCollaborator("disk platform"))?;
        let cache_dir = match self.cache_dir {
            Some(dir) => dir,
            None => default_cache_dir()?,
        };
        log::debug!("using cache directory {:?}", cache_dir);

        let mut config = Config::with_cache_dir(cache_dir);
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = self.io_timeout {
            config.io_timeout = timeout;
        }
        if let Some(bytes) = self.chunk_size {
            config.chunk_size = bytes.max(1);
        }
        if let Some(size_mb) = self.default_sandbox_size_mb {
            config.default_sandbox_size_mb = size_mb;
        }
        let cache = SandboxCache::new(
            &config.cache_dir,
            &config.temp_dir(),
            config.default_sandbox_size_mb,
        );

        Ok(LayerService {
            inner: Arc::new(Inner {
                config,
                registry: Registry::new(),
                cache,
                dialer,
                platform,
                launcher: self.launcher,
                service_vm: self.service_vm,
                service_vm_id: OnceCell::new(),
            }),
        })
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        ServiceBuilder::new()
    }
}
