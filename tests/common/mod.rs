//! In-process stand-ins for a service VM and the host disk primitives

#![allow(dead_code)]

use futures_util::{future::BoxFuture, FutureExt};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use svm_layers::{
    protocol::{
        Command, Header, ScsiAddress, HEADER_SIZE, SCSI_CONTROLLERS, SCSI_HEADER_SIZE,
        SCSI_SLOTS_PER_CONTROLLER,
    },
    transport::BoxStream,
    Dialer, DiskPlatform, LayerService, VMLauncher,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Prefix the fake VM puts in front of a tar to make a "disk"
pub const VHD_MAGIC: &[u8] = b"VHD:";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tar_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn tar_entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(archive);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut contents).unwrap();
            (name, contents)
        })
        .collect()
}

/// One request as the fake VM saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Option<ScsiAddress>,
    pub payload_len: u64,
}

/// A service VM speaking the layer protocol over in-memory pipes
#[derive(Default)]
pub struct FakeVM {
    dials: AtomicUsize,
    terminates: AtomicUsize,
    failing: Mutex<HashSet<Command>>,
    requests: Mutex<Vec<Request>>,
    sandbox_tar: Mutex<Vec<u8>>,
    delay: Mutex<Option<Duration>>,
    cut_off: Mutex<Option<usize>>,
}

impl FakeVM {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Answer `command` with ResponseFail from now on
    pub fn fail(&self, command: Command) {
        self.failing.lock().unwrap().insert(command);
    }

    pub fn succeed(&self, command: Command) {
        self.failing.lock().unwrap().remove(&command);
    }

    /// Tar returned for every ExportSandbox
    pub fn set_sandbox_tar(&self, tar: Vec<u8>) {
        *self.sandbox_tar.lock().unwrap() = tar;
    }

    /// Announce every response payload in full but hang up after sending
    /// only `bytes` of it
    pub fn hang_up_after(&self, bytes: usize) {
        *self.cut_off.lock().unwrap() = Some(bytes);
    }

    /// Sleep this long before answering each request
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn serve(self: Arc<Self>, mut stream: DuplexStream) {
        let mut bytes = [0u8; HEADER_SIZE];
        while stream.read_exact(&mut bytes).await.is_ok() {
            let header = Header::decode(&bytes).unwrap();
            let mut payload_len = header.payload_len().unwrap();
            if header.command == Command::Terminate {
                self.terminates.fetch_add(1, Ordering::SeqCst);
                break;
            }

            let address = if header.command.has_scsi_header() {
                let mut scsi = [0u8; SCSI_HEADER_SIZE];
                stream.read_exact(&mut scsi).await.unwrap();
                payload_len -= SCSI_HEADER_SIZE as u64;
                Some(ScsiAddress::decode(&scsi).unwrap())
            } else {
                None
            };
            let mut payload = vec![0u8; payload_len as usize];
            stream.read_exact(&mut payload).await.unwrap();
            self.requests.lock().unwrap().push(Request {
                command: header.command,
                address,
                payload_len,
            });

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let failing = self.failing.lock().unwrap().contains(&header.command);
            let response = if failing {
                Err(b"operation failed in fake VM".to_vec())
            } else {
                Ok(match header.command {
                    Command::Import => [VHD_MAGIC, &payload[..]].concat(),
                    Command::Export => payload
                        .strip_prefix(VHD_MAGIC)
                        .expect("export of something that isn't a fake disk")
                        .to_vec(),
                    Command::CreateSandbox => Vec::new(),
                    Command::ExportSandbox => self.sandbox_tar.lock().unwrap().clone(),
                    other => panic!("unexpected {} request", other),
                })
            };
            let (command, body) = match response {
                Ok(body) => (Command::ResponseOK, body),
                Err(body) => (Command::ResponseFail, body),
            };
            let header = Header::new(command, body.len() as i64);
            let cut_off = *self.cut_off.lock().unwrap();
            let sent = match cut_off {
                Some(bytes) => &body[..bytes.min(body.len())],
                None => &body[..],
            };
            if stream.write_all(&header.encode()).await.is_err()
                || stream.write_all(sent).await.is_err()
                || cut_off.is_some()
            {
                break;
            }
        }
    }
}

/// Dials a [FakeVM], starting one server task per connection
#[derive(Clone)]
pub struct FakeDialer {
    vms: Arc<Mutex<HashMap<String, Arc<FakeVM>>>>,
}

impl FakeDialer {
    pub fn new() -> Self {
        FakeDialer {
            vms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_vm(self, vm_id: &str, vm: &Arc<FakeVM>) -> Self {
        self.vms.lock().unwrap().insert(vm_id.to_string(), vm.clone());
        self
    }
}

impl Dialer for FakeDialer {
    fn dial(&self, vm_id: &str, _service_id: &str) -> BoxFuture<'static, io::Result<BoxStream>> {
        let vm = self.vms.lock().unwrap().get(vm_id).cloned();
        async move {
            let vm = vm.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such VM"))?;
            vm.dials.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = tokio::io::duplex(16 * 1024);
            tokio::spawn(vm.serve(remote));
            Ok(Box::new(local) as BoxStream)
        }
        .boxed()
    }
}

/// A dialer whose dials never finish
pub struct HangingDialer;

impl Dialer for HangingDialer {
    fn dial(&self, _: &str, _: &str) -> BoxFuture<'static, io::Result<BoxStream>> {
        futures_util::future::pending().boxed()
    }
}

/// A SCSI bus with every slot tracked, handing out the lowest free slot
#[derive(Default)]
pub struct FakeBus {
    slots: Mutex<HashMap<ScsiAddress, PathBuf>>,
    creates: AtomicUsize,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    failing_detach: Mutex<bool>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn occupied(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn fail_detach(&self, fail: bool) {
        *self.failing_detach.lock().unwrap() = fail;
    }
}

/// Contents of a freshly created, unformatted disk
pub fn blank_disk(size_mb: u64) -> Vec<u8> {
    format!("blank disk, {} MB\n", size_mb).into_bytes()
}

#[derive(Clone)]
pub struct FakePlatform(pub Arc<FakeBus>);

impl DiskPlatform for FakePlatform {
    fn create_disk(&self, path: &Path, size_mb: u64) -> BoxFuture<'static, io::Result<()>> {
        let bus = self.0.clone();
        let path = path.to_path_buf();
        async move {
            bus.creates.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(path, blank_disk(size_mb)).await
        }
        .boxed()
    }

    fn attach(&self, _vm_id: &str, path: &Path) -> BoxFuture<'static, io::Result<String>> {
        let bus = self.0.clone();
        let path = path.to_path_buf();
        async move {
            bus.attaches.fetch_add(1, Ordering::SeqCst);
            let mut slots = bus.slots.lock().unwrap();
            if slots.values().any(|p| *p == path) {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "attached twice"));
            }
            for controller in 0..SCSI_CONTROLLERS {
                for location in 0..SCSI_SLOTS_PER_CONTROLLER {
                    let address = ScsiAddress::new(controller, location);
                    if !slots.contains_key(&address) {
                        slots.insert(address, path);
                        return Ok(format!("disk attached at SCSI {} {}", controller, location));
                    }
                }
            }
            Err(io::Error::new(io::ErrorKind::Other, "bus full"))
        }
        .boxed()
    }

    fn detach(&self, _vm_id: &str, address: ScsiAddress) -> BoxFuture<'static, io::Result<()>> {
        let bus = self.0.clone();
        async move {
            if *bus.failing_detach.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::Other, "detach refused"));
            }
            bus.detaches.fetch_add(1, Ordering::SeqCst);
            match bus.slots.lock().unwrap().remove(&address) {
                Some(_) => Ok(()),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "slot already empty")),
            }
        }
        .boxed()
    }
}

/// Counts VM starts and stops, optionally slow or failing to start
#[derive(Default)]
pub struct FakeLauncher {
    starts: AtomicUsize,
    stops: AtomicUsize,
    start_delay: Mutex<Option<Duration>>,
    start_fails: Mutex<bool>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_starts(&self) {
        *self.start_fails.lock().unwrap() = true;
    }
}

#[derive(Clone)]
pub struct CountingLauncher(pub Arc<FakeLauncher>);

impl VMLauncher for CountingLauncher {
    fn start(&self, _vm_id: &str) -> BoxFuture<'static, io::Result<()>> {
        let launcher = self.0.clone();
        async move {
            launcher.starts.fetch_add(1, Ordering::SeqCst);
            let delay = *launcher.start_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if *launcher.start_fails.lock().unwrap() {
                Err(io::Error::new(io::ErrorKind::Other, "hypervisor said no"))
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn stop(&self, _vm_id: &str) -> BoxFuture<'static, io::Result<()>> {
        let launcher = self.0.clone();
        async move {
            launcher.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}

/// Everything a test needs to drive one [LayerService]
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub vm: Arc<FakeVM>,
    pub bus: Arc<FakeBus>,
    pub launcher: Arc<FakeLauncher>,
    pub service: LayerService,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_sandbox_size(svm_layers::config::DEFAULT_SANDBOX_SIZE_MB)
    }

    pub fn with_sandbox_size(size_mb: u64) -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let vm = FakeVM::new();
        let bus = FakeBus::new();
        let launcher = FakeLauncher::new();
        let service = LayerService::builder()
            .dialer(Arc::new(FakeDialer::new().with_vm("vm-1", &vm)))
            .disk_platform(Arc::new(FakePlatform(bus.clone())))
            .launcher(Arc::new(CountingLauncher(launcher.clone())))
            .cache_dir(&dir.path().join("cache"))
            .default_sandbox_size_mb(size_mb)
            .io_timeout(Duration::from_secs(10))
            .chunk_size(1000)
            .build()
            .unwrap();
        Harness {
            dir,
            vm,
            bus,
            launcher,
            service,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Poll `condition` until it holds, for up to a couple of seconds
///
/// The fake VM sees Terminate after the client has already moved on.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
