//! End-to-end tests of the capture core against synthetic cameras

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use microbe_capture::OurError;
use microbe_capture::backend::{Backends, BlockMode, SyntheticBackend, SyntheticOptions};
use microbe_capture::config::{CameraConfig, CameraId, SessionTimings};
use microbe_capture::registry::{CameraHandle, CameraRegistry};
use microbe_capture::session::SessionState;
use microbe_capture::snapshot::save_snapshot;
use tokio::time::timeout;

fn test_handle(backend: SyntheticBackend) -> CameraHandle {
    CameraHandle::new(CameraRegistry::new(
        Backends::synthetic(backend),
        SessionTimings {
            read_retry: Duration::from_millis(20),
            stop_timeout: Duration::from_millis(500),
            open_timeout: Duration::from_secs(2),
        },
    ))
}

#[tokio::test]
async fn test_usb_camera_lifecycle() {
    let backend = SyntheticBackend::default();
    let handle = test_handle(backend.clone());
    let id = CameraId::Index(0);

    handle
        .add(CameraConfig::new(0u32, "usb", 640, 480, 30))
        .await
        .expect("add");
    handle.start(id.clone()).await.expect("start");

    let frame = handle
        .wait_for_frame(None, Duration::from_millis(500))
        .await
        .expect("frame within 500ms");
    assert_eq!(frame.shape(), (480, 640, 3));

    let info = handle.info(&id).expect("registered");
    assert!(info.streaming);
    assert_eq!(info.resolution, "640x480");
    assert_eq!(info.fps, 30);
    assert_eq!(info.actual_resolution.as_deref(), Some("640x480"));

    let started = Instant::now();
    timeout(Duration::from_millis(2000), handle.stop(id.clone()))
        .await
        .expect("stop within 2s")
        .expect("registered");
    assert!(started.elapsed() < Duration::from_millis(2000));

    assert!(handle.active_frame().is_none());
    assert!(handle.snapshot(Some(&id)).is_none());
    assert_eq!(backend.open_devices(), 0);
}

#[tokio::test]
async fn test_no_cameras_no_frames() {
    let handle = test_handle(SyntheticBackend::default());
    assert!(handle.active_frame().is_none());
    assert!(handle.snapshot(None).is_none());
    assert!(handle.list().is_empty());
    assert!(matches!(
        handle.start(CameraId::Index(9)).await,
        Err(OurError::CameraNotFound(_))
    ));
}

#[tokio::test]
async fn test_latest_start_becomes_active() {
    let handle = test_handle(SyntheticBackend::default());
    handle
        .add(CameraConfig::new(0u32, "usb", 64, 48, 30))
        .await
        .expect("add");
    handle
        .add(CameraConfig::new(1u32, "usb", 32, 24, 30))
        .await
        .expect("add");
    handle.start(CameraId::Index(0)).await.expect("start 0");
    let before = handle.info(&CameraId::Index(0)).expect("registered");

    handle.start(CameraId::Index(1)).await.expect("start 1");
    assert_eq!(handle.registry().active_id(), Some(CameraId::Index(1)));

    let frame = handle
        .wait_for_frame(None, Duration::from_secs(1))
        .await
        .expect("frame from camera 1");
    assert_eq!(frame.shape(), (24, 32, 3));

    let after = handle.info(&CameraId::Index(0)).expect("registered");
    assert!(after.streaming);
    assert_eq!(after.resolution, before.resolution);
    assert_eq!(after.state, SessionState::Streaming);

    handle.stop_all().await.expect("stop all");
    assert!(!handle.info(&CameraId::Index(0)).expect("registered").streaming);
    assert!(!handle.info(&CameraId::Index(1)).expect("registered").streaming);
}

#[tokio::test]
async fn test_snapshots_are_independent_copies() {
    let handle = test_handle(SyntheticBackend::default());
    handle
        .add(CameraConfig::new(0u32, "usb", 16, 8, 30))
        .await
        .expect("add");
    handle.start(CameraId::Index(0)).await.expect("start");

    let first = handle
        .wait_for_frame(None, Duration::from_secs(1))
        .await
        .expect("frame");
    let original = first.clone();
    let mut owned = first.into_data();
    owned.fill(0);

    let second = handle.active_frame().expect("frame");
    assert_ne!(second.data(), owned.as_slice());
    assert_eq!(original.shape(), second.shape());

    handle.stop_all().await.expect("stop all");
}

#[tokio::test]
async fn test_stop_is_bounded_when_reads_hang() {
    let backend = SyntheticBackend::new(SyntheticOptions {
        block_reads: BlockMode::Forever,
        ..Default::default()
    });
    let handle = test_handle(backend.clone());
    handle
        .add(CameraConfig::new(0u32, "usb", 32, 24, 30))
        .await
        .expect("add");
    handle.start(CameraId::Index(0)).await.expect("start");
    assert!(handle.active_frame().is_none());

    let started = Instant::now();
    timeout(Duration::from_secs(2), handle.stop(CameraId::Index(0)))
        .await
        .expect("stop is bounded")
        .expect("registered");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(backend.forced_releases(), 1);

    let info = handle.info(&CameraId::Index(0)).expect("registered");
    assert!(!info.streaming);
    assert_eq!(info.state, SessionState::Stopped);
}

#[tokio::test]
async fn test_open_failure_is_deterministic() {
    let backend = SyntheticBackend::new(SyntheticOptions {
        fail_open: true,
        ..Default::default()
    });
    let handle = test_handle(backend.clone());
    let id = CameraId::Index(0);
    handle
        .add(CameraConfig::new(0u32, "usb", 32, 24, 30))
        .await
        .expect("add");

    for attempt in 1..=2 {
        assert!(matches!(
            handle.start(id.clone()).await,
            Err(OurError::DeviceOpen { .. })
        ));
        assert_eq!(backend.open_attempts(), attempt * 2);
        let info = handle.info(&id).expect("registered");
        assert!(!info.streaming);
        assert_eq!(info.state, SessionState::Failed);
    }
    assert!(handle.active_frame().is_none());
}

#[tokio::test]
async fn test_unsupported_type_fails_before_open() {
    let backend = SyntheticBackend::default();
    let handle = test_handle(backend.clone());
    let registry = handle.registry();

    assert!(registry.add_camera("rtsp://scope.local/stream", "firewire", 640, 480, 30));
    assert!(!registry.start_camera(&CameraId::from("rtsp://scope.local/stream")));
    assert_eq!(backend.open_attempts(), 0);
}

#[tokio::test]
async fn test_ip_camera_streams() {
    let handle = test_handle(SyntheticBackend::default());
    let id = CameraId::from("rtsp://scope.local/stream");
    handle
        .add(CameraConfig::new(id.clone(), "ip", 64, 48, 30))
        .await
        .expect("add");
    handle.start(id.clone()).await.expect("start");

    let info = handle.info(&id).expect("registered");
    assert_eq!(info.camera_type.as_str(), "ip");
    assert!(
        handle
            .wait_for_frame(Some(&id), Duration::from_secs(1))
            .await
            .is_some()
    );
    handle.stop_all().await.expect("stop all");
}

#[tokio::test]
async fn test_failing_camera_does_not_affect_others() {
    let handle = test_handle(SyntheticBackend::default());
    handle
        .add(CameraConfig::new(0u32, "usb", 32, 24, 30))
        .await
        .expect("add");
    handle
        .add(CameraConfig::new(1u32, "csi", 32, 24, 30))
        .await
        .expect("add");
    handle
        .add(CameraConfig::new(2u32, "usb", 0, 24, 30))
        .await
        .expect("add");

    handle.start(CameraId::Index(0)).await.expect("start 0");
    assert!(matches!(
        handle.start(CameraId::Index(2)).await,
        Err(OurError::Configuration(_))
    ));
    handle.start(CameraId::Index(1)).await.expect("start 1");

    assert!(handle.info(&CameraId::Index(0)).expect("registered").streaming);
    assert!(handle.info(&CameraId::Index(1)).expect("registered").streaming);
    assert!(!handle.info(&CameraId::Index(2)).expect("registered").streaming);
    assert_eq!(handle.registry().active_id(), Some(CameraId::Index(1)));

    handle.stop_all().await.expect("stop all");
}

#[tokio::test]
async fn test_snapshot_saved_to_disk() {
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = test_handle(SyntheticBackend::default());
    handle
        .add(CameraConfig::new(0u32, "usb", 64, 48, 30))
        .await
        .expect("add");
    handle.start(CameraId::Index(0)).await.expect("start");

    let frame = handle
        .wait_for_frame(None, Duration::from_secs(1))
        .await
        .expect("frame");
    handle.stop_all().await.expect("stop all");

    let path = save_snapshot(&frame, dir.path(), 85).expect("saved");
    let decoded = image::open(&path).expect("valid jpeg");
    assert_eq!((decoded.width(), decoded.height()), (64, 48));
}

#[test]
fn test_concurrent_readers_see_whole_frames() {
    let registry = Arc::new(CameraRegistry::new(
        Backends::synthetic(SyntheticBackend::default()),
        SessionTimings {
            read_retry: Duration::from_millis(20),
            stop_timeout: Duration::from_millis(500),
            open_timeout: Duration::from_secs(2),
        },
    ));
    let id = CameraId::Index(0);
    assert!(registry.add_camera(0u32, "usb", 32, 24, 120));
    assert!(registry.start_camera(&id));

    let stop_at = Instant::now() + Duration::from_millis(400);
    let readers: Vec<_> = (0..6)
        .map(|reader| {
            let registry = registry.clone();
            let id = id.clone();
            thread::spawn(move || {
                let mut last_sequence = 0;
                let mut copies = 0usize;
                while Instant::now() < stop_at {
                    let frame = if reader % 2 == 0 {
                        registry.active_frame()
                    } else {
                        registry.snapshot(Some(&id))
                    };
                    let Some(frame) = frame else {
                        thread::yield_now();
                        continue;
                    };

                    assert_eq!(frame.shape(), (24, 32, 3));
                    assert!(
                        frame.sequence() >= last_sequence,
                        "reader {reader} went from frame {last_sequence} back to {}",
                        frame.sequence()
                    );
                    last_sequence = frame.sequence();

                    // each row is one value, one more than the row above
                    let rows: Vec<&[u8]> = frame.data().chunks_exact(32 * 3).collect();
                    for (y, row) in rows.iter().enumerate() {
                        assert!(
                            row.iter().all(|&value| value == row[0]),
                            "row {y} of frame {} is torn",
                            frame.sequence()
                        );
                        if y > 0 {
                            assert_eq!(row[0], rows[y - 1][0].wrapping_add(1));
                        }
                    }
                    copies += 1;
                }
                (copies, last_sequence)
            })
        })
        .collect();

    for reader in readers {
        let (copies, last_sequence) = reader.join().expect("reader thread");
        assert!(copies > 0);
        assert!(last_sequence > 1);
    }
    registry.stop_all();
}
