use super::DiskPlatform;
use crate::protocol::ScsiAddress;
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};
use tokio::process::Command;

/// Disk primitives provided by an external helper program
///
/// The helper is invoked as:
///
/// ```text
/// <program> create <path> <size_mb>
/// <program> attach <vm_id> <path>        (prints a line containing "SCSI <n> <m>")
/// <program> detach <vm_id> <n> <m>
/// ```
#[derive(Clone, Debug)]
pub struct CommandPlatform {
    program: PathBuf,
}

impl CommandPlatform {
    pub fn new(program: &Path) -> Self {
        CommandPlatform {
            program: program.to_path_buf(),
        }
    }

    fn run(&self, args: Vec<OsString>) -> BoxFuture<'static, io::Result<String>> {
        let program = self.program.clone();
        async move {
            log::debug!("running disk helper {:?} {:?}", program, args);
            let output = Command::new(&program).args(&args).output().await?;
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "disk helper {:?} failed, {}\n{}",
                        program,
                        output.status,
                        String::from_utf8_lossy(&output.stderr)
                    ),
                ))
            }
        }
        .boxed()
    }
}

impl DiskPlatform for CommandPlatform {
    fn create_disk(&self, path: &Path, size_mb: u64) -> BoxFuture<'static, io::Result<()>> {
        self.run(vec![
            "create".into(),
            path.as_os_str().to_owned(),
            size_mb.to_string().into(),
        ])
        .map(|result| result.map(drop))
        .boxed()
    }

    fn attach(&self, vm_id: &str, path: &Path) -> BoxFuture<'static, io::Result<String>> {
        self.run(vec![
            "attach".into(),
            vm_id.into(),
            path.as_os_str().to_owned(),
        ])
    }

    fn detach(&self, vm_id: &str, address: ScsiAddress) -> BoxFuture<'static, io::Result<()>> {
        self.run(vec![
            "detach".into(),
            vm_id.into(),
            address.controller.to_string().into(),
            address.location.to_string().into(),
        ])
        .map(|result| result.map(drop))
        .boxed()
    }
}
