mod common;

use common::*;
use futures_util::future::join_all;
use svm_layers::{protocol::Command, LayerError};
use tokio::{io::AsyncReadExt, runtime::Runtime};

#[test]
fn import_then_export() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let tar = tar_archive(&[("etc/hostname", b"svm\n"), ("bin/true", b"\x7fELF")]);
        let layer_dir = h.path("layers/1");

        let written = h
            .service
            .import_layer("vm-1", &layer_dir, &tar[..])
            .await
            .unwrap();
        assert_eq!(written, (VHD_MAGIC.len() + tar.len()) as u64);
        let vhd = std::fs::read(layer_dir.join("layer.vhd")).unwrap();
        assert!(vhd.starts_with(VHD_MAGIC));

        let mut stream = h.service.export_layer("vm-1", &layer_dir).await.unwrap();
        let mut exported = Vec::new();
        stream.read_to_end(&mut exported).await.unwrap();
        assert_eq!(stream.finish().await.unwrap(), tar.len() as u64);
        assert_eq!(exported, tar);
        assert_eq!(
            tar_entries(&exported),
            vec![
                ("etc/hostname".to_string(), b"svm\n".to_vec()),
                ("bin/true".to_string(), b"\x7fELF".to_vec()),
            ]
        );

        let commands: Vec<Command> = h.vm.requests().iter().map(|r| r.command).collect();
        assert_eq!(commands, vec![Command::Import, Command::Export]);
        assert!(eventually(|| h.vm.terminates() == 2).await);
        assert!(h.service.registry().is_empty());
        assert_eq!(h.launcher.starts(), 2);
        assert_eq!(h.launcher.stops(), 2);
        assert!(std::fs::read_dir(h.service.config().temp_dir())
            .unwrap()
            .next()
            .is_none());
    })
}

#[test]
fn import_failure_discards_layer() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        h.vm.fail(Command::Import);
        let layer_dir = h.path("layers/bad");
        let err = h
            .service
            .import_layer("vm-1", &layer_dir, &b"not really a tar"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::OperationFailed(Command::Import)));
        assert!(!err.is_transport());
        assert!(!layer_dir.join("layer.vhd").exists());
        assert!(eventually(|| h.vm.terminates() == 1).await);
        assert!(h.service.registry().is_empty());
    })
}

#[test]
fn export_failure_is_reported_up_front() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let layer_dir = h.path("layer");
        h.service
            .import_layer("vm-1", &layer_dir, &tar_archive(&[("a", b"a")])[..])
            .await
            .unwrap();
        h.vm.fail(Command::Export);
        let err = h.service.export_layer("vm-1", &layer_dir).await.unwrap_err();
        assert!(matches!(err, LayerError::OperationFailed(Command::Export)));
        assert!(eventually(|| h.vm.terminates() == 2).await);
        assert!(h.service.registry().is_empty());
    })
}

#[test]
fn export_missing_layer() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let err = h
            .service
            .export_layer("vm-1", &h.path("nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::Storage(_)));
        assert_eq!(h.vm.dials(), 0);
        assert_eq!(h.launcher.starts(), 0);
    })
}

#[test]
fn unknown_vm_is_transport_error() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let err = h
            .service
            .import_layer("vm-2", &h.path("layer"), &b"tar"[..])
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(h.service.registry().is_empty());
        assert_eq!(h.launcher.starts(), 1);
        assert_eq!(h.launcher.stops(), 1);
    })
}

#[test]
fn concurrent_imports_share_one_vm() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        h.launcher.set_start_delay(std::time::Duration::from_millis(300));
        let tars: Vec<Vec<u8>> = (0..8)
            .map(|i| tar_archive(&[("file", format!("layer {}", i).as_bytes())]))
            .collect();
        let dirs: Vec<_> = (0..8).map(|i| h.path(&format!("layers/{}", i))).collect();

        let results = join_all(
            tars.iter()
                .zip(dirs.iter())
                .map(|(tar, dir)| h.service.import_layer("vm-1", dir, &tar[..])),
        )
        .await;
        for (result, tar) in results.into_iter().zip(tars.iter()) {
            assert_eq!(result.unwrap(), (VHD_MAGIC.len() + tar.len()) as u64);
        }
        for (dir, tar) in dirs.iter().zip(tars.iter()) {
            let vhd = std::fs::read(dir.join("layer.vhd")).unwrap();
            assert_eq!(&vhd[VHD_MAGIC.len()..], &tar[..]);
        }
        assert_eq!(h.launcher.starts(), 1);
        assert_eq!(h.launcher.stops(), 1);
        assert_eq!(h.vm.dials(), 8);
        assert!(eventually(|| h.vm.terminates() == 8).await);
        assert!(h.service.registry().is_empty());
    })
}

#[test]
fn failed_start_is_seen_by_every_waiter() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        h.launcher.set_start_delay(std::time::Duration::from_millis(300));
        h.launcher.fail_starts();
        let dirs: Vec<_> = (0..3).map(|i| h.path(&format!("layers/{}", i))).collect();
        let results = join_all(
            dirs.iter()
                .map(|dir| h.service.import_layer("vm-1", dir, &b"tar"[..])),
        )
        .await;
        for result in results {
            assert!(matches!(
                result,
                Err(LayerError::VM(svm_layers::VMError::StartFailed(_)))
            ));
        }
        assert_eq!(h.launcher.starts(), 1);
        assert_eq!(h.launcher.stops(), 0);
        assert_eq!(h.vm.dials(), 0);
        assert!(h.service.registry().is_empty());
    })
}

#[test]
fn dial_timeout() {
    Runtime::new().unwrap().block_on(async {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let service = svm_layers::LayerService::builder()
            .dialer(std::sync::Arc::new(HangingDialer))
            .disk_platform(std::sync::Arc::new(FakePlatform(FakeBus::new())))
            .cache_dir(dir.path())
            .connect_timeout(std::time::Duration::from_millis(50))
            .build()
            .unwrap();
        let started = std::time::Instant::now();
        let err = service
            .import_layer("vm-1", &dir.path().join("layer"), &b"tar"[..])
            .await
            .unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(err.is_transport());
        assert!(matches!(
            err,
            LayerError::Transport(svm_layers::TransportError::DialTimeout(_))
        ));
        assert!(service.registry().is_empty());
    })
}

#[test]
fn export_cut_short_fails_the_read() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let layer_dir = h.path("layer");
        let tar = tar_archive(&[("big", &vec![3u8; 4096])]);
        h.service
            .import_layer("vm-1", &layer_dir, &tar[..])
            .await
            .unwrap();
        h.vm.hang_up_after(10);

        let mut stream = h.service.export_layer("vm-1", &layer_dir).await.unwrap();
        let mut exported = Vec::new();
        let err = stream.read_to_end(&mut exported).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert_eq!(exported, &tar[..10]);
        let err = stream.finish().await.unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(
            err,
            LayerError::Transport(svm_layers::TransportError::Truncated { received: 10, .. })
        ));
        assert!(h.service.registry().is_empty());
    })
}

#[test]
fn export_sandbox_cut_short_fails_the_read() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::with_sandbox_size(20);
        let tar = tar_archive(&[("upper/file", &vec![5u8; 2048])]);
        h.vm.set_sandbox_tar(tar.clone());
        let dir = h.path("container");
        h.service
            .create_sandbox("vm-1", &dir.join("sandbox.vhdx"), 40)
            .await
            .unwrap();
        h.vm.hang_up_after(100);

        let mut stream = h.service.export_sandbox_layer("vm-1", &dir).await.unwrap();
        let mut exported = Vec::new();
        assert!(stream.read_to_end(&mut exported).await.is_err());
        assert_eq!(exported, &tar[..100]);
        assert!(stream.finish().await.is_err());
        assert_eq!(h.bus.occupied(), 0);
        assert!(h.service.registry().is_empty());
    })
}

/// Abandoning a stream doesn't cancel the transfer; it runs to completion
/// in the background and still releases everything it holds.
#[test]
fn dropped_stream_still_cleans_up() {
    Runtime::new().unwrap().block_on(async {
        let h = Harness::new();
        let layer_dir = h.path("layer");
        let big = vec![7u8; 256 * 1024];
        h.service
            .import_layer("vm-1", &layer_dir, &tar_archive(&[("big", &big)])[..])
            .await
            .unwrap();

        let mut stream = h.service.export_layer("vm-1", &layer_dir).await.unwrap();
        let mut first = [0u8; 512];
        stream.read_exact(&mut first).await.unwrap();
        drop(stream);

        assert!(eventually(|| h.service.registry().is_empty()).await);
        assert_eq!(h.launcher.stops(), 2);
    })
}
