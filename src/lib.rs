//! Outsourcing filesystem layer work to a helper "service VM"
//!
//! A [LayerService] turns tar archives into virtual disk layers and back,
//! and provisions writable sandbox disks, by driving a small binary
//! protocol against a service VM that can mount the container filesystem
//! format natively. Service VMs are reference counted so that concurrent
//! operations share one VM and its hot-plugged disks.

#[cfg(not(unix))]
compile_error!("svm-layers only works on unix hosts");

#[macro_use] extern crate lazy_static;

pub use svm_layers_protocol as protocol;

pub mod cache;
pub mod codec;
pub mod config;
pub mod disk;
pub mod errors;
pub mod launcher;
pub mod registry;
pub mod service;
pub mod signal;
pub mod transport;
pub mod vm;

mod refcount;
mod storage;

pub use crate::{
    config::{Config, VMIdSource},
    disk::{CommandPlatform, DiskPlatform},
    errors::{DiskError, LayerError, TransportError, VMError},
    launcher::{ExternalVM, VMLauncher},
    service::{DiskAttachment, LayerService, LayerStream, ServiceBuilder},
    transport::{Dialer, TcpDialer, UnixDialer},
};
