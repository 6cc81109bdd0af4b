//! Camera session: one device, one acquisition thread, one latest-frame cell.
//!
//! The device is opened on the acquisition thread and never leaves it. `start()` waits for
//! that thread to report whether the open worked; `stop()` waits for it to exit, but only
//! for a bounded time. Readers touch nothing but the state and the frame cell, both behind
//! short-lived locks, so they never wait on the device or on a control operation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::{Backends, CaptureDevice, DeviceReport, ReleaseHandle};
use crate::config::{CameraConfig, CameraId, CameraType, SessionTimings};
use crate::frame::{Frame, FrameCell};
use crate::pipeline::{self, DeviceDescriptor};
use crate::{OurError, OurResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Streaming,
    Failed,
}

/// Static configuration plus whatever the device reports while streaming
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub id: CameraId,
    #[serde(rename = "type")]
    pub camera_type: CameraType,
    pub resolution: String,
    pub fps: u32,
    pub streaming: bool,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    /// Frames captured since the last start
    pub frames_captured: u64,
}

/// Runs on the acquisition thread for every frame published to the cell
pub type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Sent by the acquisition thread once its device is open
struct OpenReport {
    backend: &'static str,
    descriptor: String,
    device: DeviceReport,
    release: Option<ReleaseHandle>,
}

#[derive(Default)]
struct LiveStatus {
    backend: Option<&'static str>,
    descriptor: Option<String>,
    device: DeviceReport,
}

/// Control side of a running acquisition thread
struct Worker {
    running: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
    release: Option<ReleaseHandle>,
}

pub struct CameraSession {
    config: CameraConfig,
    backends: Backends,
    timings: SessionTimings,
    cell: Arc<FrameCell>,
    frames: Arc<AtomicU64>,
    state: Mutex<SessionState>,
    live: Mutex<LiveStatus>,
    /// Serialises control operations; readers never take it. start() lets go of it while
    /// the device opens so a stop() can cancel the attempt.
    worker: Mutex<Option<Worker>>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        error!("Camera session {what} mutex poisoned: {e}");
        e.into_inner()
    })
}

impl CameraSession {
    pub fn new(config: CameraConfig, backends: Backends, timings: SessionTimings) -> Self {
        Self {
            config,
            backends,
            timings,
            cell: Arc::default(),
            frames: Arc::default(),
            state: Mutex::new(SessionState::Stopped),
            live: Mutex::default(),
            worker: Mutex::new(None),
            callback: Arc::default(),
        }
    }

    pub fn id(&self) -> &CameraId {
        &self.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state, "state")
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Install or clear the per-frame callback. Takes effect on the next frame, running or not.
    ///
    /// A panicking callback is logged and skipped; acquisition carries on.
    pub fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        *lock(&*self.callback, "frame callback") = callback;
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state, "state") = state;
    }

    /// Open the device and launch the acquisition thread.
    ///
    /// Succeeds immediately when already streaming. A configuration that can't produce
    /// descriptors fails without leaving the current state; a device that won't open on any
    /// descriptor leaves the session `Failed` with no thread running.
    pub fn start(&self) -> OurResult<()> {
        let (running, open_rx) = {
            let mut worker = lock(&self.worker, "worker");
            match self.state() {
                SessionState::Streaming => {
                    debug!("Camera {} is already streaming", self.config.id);
                    return Ok(());
                }
                SessionState::Starting => {
                    return Err(OurError::App(format!(
                        "Camera {} is already starting",
                        self.config.id
                    )));
                }
                SessionState::Stopped | SessionState::Failed => {}
            }

            let descriptors = pipeline::descriptors(&self.config)?;

            self.set_state(SessionState::Starting);
            self.frames.store(0, Ordering::Relaxed);
            info!(
                "Starting {} camera {} at {}@{}fps",
                self.config.camera_type,
                self.config.id,
                self.config.resolution(),
                self.config.fps
            );

            let running = Arc::new(AtomicBool::new(true));
            let (open_tx, open_rx) = mpsc::sync_channel(1);
            let (exit_tx, exit_rx) = mpsc::channel();
            let acquisition = Acquisition {
                config: self.config.clone(),
                descriptors,
                backends: self.backends.clone(),
                timings: self.timings,
                running: running.clone(),
                cell: self.cell.clone(),
                frames: self.frames.clone(),
                callback: self.callback.clone(),
            };

            let thread = thread::Builder::new()
                .name(format!("camera-{}", self.config.id))
                .spawn(move || acquisition.run(open_tx, ExitSignal(exit_tx)))
                .map_err(|e| {
                    self.set_state(SessionState::Failed);
                    OurError::Io(e)
                })?;

            *worker = Some(Worker {
                running: running.clone(),
                exited: exit_rx,
                thread,
                release: None,
            });
            (running, open_rx)
        };

        let opened = open_rx.recv_timeout(self.timings.open_timeout);

        let mut worker = lock(&self.worker, "worker");
        let ours = worker
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.running, &running));
        if !ours {
            info!("Camera {}: start cancelled by stop()", self.config.id);
            return Err(OurError::DeviceOpen {
                camera: self.config.id.clone(),
                reason: "start cancelled by stop".to_string(),
            });
        }

        match opened {
            Ok(Ok(report)) => {
                *lock(&self.live, "live status") = LiveStatus {
                    backend: Some(report.backend),
                    descriptor: Some(report.descriptor.clone()),
                    device: report.device,
                };
                if let Some(current) = worker.as_mut() {
                    current.release = report.release;
                }
                self.set_state(SessionState::Streaming);
                info!(
                    "Camera {} streaming via {} ({})",
                    self.config.id, report.backend, report.descriptor
                );
                Ok(())
            }
            Ok(Err(e)) => {
                // the thread returns right after reporting
                if let Some(run) = worker.take() {
                    if run.thread.join().is_err() {
                        error!("Acquisition thread for camera {} panicked", self.config.id);
                    }
                }
                self.set_state(SessionState::Failed);
                error!("Failed to open camera {}: {e}", self.config.id);
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                running.store(false, Ordering::Release);
                // dropping the run detaches its thread
                worker.take();
                self.set_state(SessionState::Failed);
                warn!(
                    "Camera {} did not open within {:?}, abandoning the attempt",
                    self.config.id, self.timings.open_timeout
                );
                Err(OurError::DeviceOpen {
                    camera: self.config.id.clone(),
                    reason: format!("open timed out after {:?}", self.timings.open_timeout),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(run) = worker.take() {
                    if run.thread.join().is_err() {
                        error!("Acquisition thread for camera {} panicked", self.config.id);
                    }
                }
                self.set_state(SessionState::Failed);
                Err(OurError::DeviceOpen {
                    camera: self.config.id.clone(),
                    reason: "acquisition thread exited before reporting".to_string(),
                })
            }
        }
    }

    /// Stop streaming. Safe to call repeatedly and while a device read is in flight.
    ///
    /// Waits at most the stop timeout for the acquisition thread. Past that the device is
    /// released out-of-band when its backend allows it and the thread is left to finish on
    /// its own; its frames can no longer reach the cell either way.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker, "worker");
        let Some(worker) = worker.take() else {
            if self.state() == SessionState::Failed {
                self.set_state(SessionState::Stopped);
            }
            debug!("Camera {} is not streaming", self.config.id);
            return;
        };

        worker.running.store(false, Ordering::Release);
        match worker.exited.recv_timeout(self.timings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Acquisition thread for camera {} panicked", self.config.id);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let timeout = OurError::ShutdownTimeout {
                    camera: self.config.id.clone(),
                    waited: self.timings.stop_timeout,
                };
                match &worker.release {
                    Some(release) => {
                        warn!("{timeout}, forcing device release");
                        release();
                    }
                    None => warn!(
                        "{timeout}; no way to release the device early, \
                         it closes when its pending open or read returns"
                    ),
                }
                // dropping the JoinHandle detaches the thread
            }
        }

        self.cell.clear();
        *lock(&self.live, "live status") = LiveStatus::default();
        self.set_state(SessionState::Stopped);
        info!("Camera {} stopped", self.config.id);
    }

    /// Copy of the newest frame while streaming. Never touches the device.
    pub fn snapshot(&self) -> Option<Frame> {
        if !self.is_streaming() {
            return None;
        }
        let frame = self.cell.latest();
        if let Some(frame) = &frame {
            debug!(
                "Snapshot of camera {} (frame {})",
                self.config.id,
                frame.sequence()
            );
        }
        frame
    }

    pub fn info(&self) -> CameraInfo {
        let state = self.state();
        let streaming = state == SessionState::Streaming;
        let live = lock(&self.live, "live status");
        let actual_resolution = match (live.device.width, live.device.height) {
            (Some(width), Some(height)) if streaming => Some(format!("{width}x{height}")),
            _ => None,
        };

        CameraInfo {
            id: self.config.id.clone(),
            camera_type: self.config.camera_type.clone(),
            resolution: self.config.resolution(),
            fps: self.config.fps,
            streaming,
            state,
            actual_fps: live.device.fps.filter(|_| streaming),
            actual_resolution,
            backend: live.backend.map(str::to_string),
            descriptor: live.descriptor.clone(),
            frames_captured: self.frames.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tells `stop()` the thread is done, however the thread ends
struct ExitSignal(mpsc::Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Everything the acquisition thread owns
struct Acquisition {
    config: CameraConfig,
    descriptors: Vec<DeviceDescriptor>,
    backends: Backends,
    timings: SessionTimings,
    running: Arc<AtomicBool>,
    cell: Arc<FrameCell>,
    frames: Arc<AtomicU64>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
}

impl Acquisition {
    fn run(self, open_tx: mpsc::SyncSender<OurResult<OpenReport>>, _exit: ExitSignal) {
        let camera = &self.config.id;
        let mut opened = match self.backends.open(camera, &self.descriptors) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let device = opened.device.as_mut();

        let CameraConfig {
            width, height, fps, ..
        } = self.config;
        if let Err(e) = device.apply_format(width, height, fps) {
            warn!("Camera {camera}: couldn't apply {width}x{height}@{fps}fps: {e}");
        }
        if let Err(e) = device.minimize_buffering() {
            debug!("Camera {camera}: couldn't shrink device buffering: {e}");
        }

        let report = OpenReport {
            backend: opened.backend,
            descriptor: opened.descriptor.to_string(),
            device: device.report(),
            release: device.release_handle(),
        };
        if open_tx.send(Ok(report)).is_err() {
            debug!("Camera {camera}: start() stopped waiting, closing the device");
            return;
        }

        self.capture(device);
        debug!("Camera {camera}: acquisition thread exiting");
    }

    fn capture(&self, device: &mut dyn CaptureDevice) {
        let camera = &self.config.id;
        let mut failures: u64 = 0;
        let mut callback_failures: u64 = 0;

        while self.running.load(Ordering::Acquire) {
            match device.read_frame() {
                Ok(frame) => {
                    if failures > 0 {
                        info!("Camera {camera} recovered after {failures} failed reads");
                        failures = 0;
                    }
                    let sequence = self.frames.load(Ordering::Relaxed) + 1;
                    let frame = frame.with_sequence(sequence);
                    let callback = lock(&*self.callback, "frame callback").clone();
                    let Some(callback) = callback else {
                        if !self.cell.publish(frame, &self.running) {
                            break;
                        }
                        self.frames.store(sequence, Ordering::Relaxed);
                        continue;
                    };

                    if !self.cell.publish(frame.clone(), &self.running) {
                        break;
                    }
                    self.frames.store(sequence, Ordering::Relaxed);
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&frame)))
                    {
                        callback_failures += 1;
                        let reason = payload
                            .downcast_ref::<&str>()
                            .map(|reason| reason.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        if callback_failures == 1 {
                            warn!("Camera {camera}: frame callback error: {reason}");
                        } else {
                            debug!("Camera {camera}: frame callback error {callback_failures}: {reason}");
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!(
                            "Camera {camera}: {e}, retrying every {:?}",
                            self.timings.read_retry
                        );
                    } else {
                        debug!("Camera {camera}: read failure {failures}: {e}");
                    }
                    thread::sleep(self.timings.read_retry);
                }
            }
        }
    }
}
