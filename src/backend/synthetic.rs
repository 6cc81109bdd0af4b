//! Generated test-pattern cameras.
//!
//! Claims every descriptor kind and produces RGB frames paced at the requested rate, so the
//! whole capture path runs without hardware. [`SyntheticOptions`] injects the faults real
//! devices show: opens that fail, reads that fail now and then, reads that never return.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use super::{CaptureDevice, DeviceBackend, DeviceReport, ReleaseHandle};
use crate::frame::Frame;
use crate::pipeline::{DescriptorKind, DeviceDescriptor};
use crate::{OurError, OurResult};

const CAPABILITIES: [DescriptorKind; 4] = [
    DescriptorKind::Usb,
    DescriptorKind::Csi,
    DescriptorKind::Ip,
    DescriptorKind::Generic,
];

// Generic descriptors carry no format until apply_format runs
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;

/// How reads behave once the device is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMode {
    /// Frames arrive at the configured rate
    #[default]
    Never,
    /// Every read hangs until the device is released out-of-band
    UntilReleased,
    /// Every read hangs for good, release or not
    Forever,
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticOptions {
    /// Every open fails
    pub fail_open: bool,
    /// Only the generic fallback descriptor opens
    pub fail_primary: bool,
    /// Every n-th read fails
    pub fail_every: Option<u64>,
    pub block_reads: BlockMode,
    /// Time an open takes
    pub open_delay: Duration,
}

/// Counters shared between a backend and every device it opened
#[derive(Debug, Default)]
struct Counters {
    opens: AtomicUsize,
    open_devices: AtomicUsize,
    releases: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    options: SyntheticOptions,
    counters: Arc<Counters>,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            counters: Arc::default(),
        }
    }

    /// Open attempts so far, failed ones included
    pub fn open_attempts(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet dropped
    pub fn open_devices(&self) -> usize {
        self.counters.open_devices.load(Ordering::SeqCst)
    }

    /// Out-of-band releases performed
    pub fn forced_releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn capabilities(&self) -> &[DescriptorKind] {
        &CAPABILITIES
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> OurResult<Box<dyn CaptureDevice>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if !self.options.open_delay.is_zero() {
            thread::sleep(self.options.open_delay);
        }
        if self.options.fail_open {
            return Err(OurError::App(format!("synthetic open of {descriptor} refused")));
        }
        if self.options.fail_primary && descriptor.kind() != DescriptorKind::Generic {
            return Err(OurError::App(format!(
                "synthetic primary open of {descriptor} refused"
            )));
        }

        let (width, height, fps) = match descriptor {
            DeviceDescriptor::Usb {
                width, height, fps, ..
            }
            | DeviceDescriptor::Csi {
                width, height, fps, ..
            } => (*width, *height, *fps),
            DeviceDescriptor::Ip { width, height, .. } => (*width, *height, DEFAULT_FPS),
            DeviceDescriptor::Generic { .. } => (DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_FPS),
        };

        self.counters.open_devices.fetch_add(1, Ordering::SeqCst);
        debug!("Synthetic device opened for {descriptor}");
        Ok(Box::new(SyntheticDevice {
            width,
            height,
            fps,
            sequence: 0,
            options: self.options.clone(),
            gate: Arc::default(),
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Debug, Default)]
struct ReleaseGate {
    released: Mutex<bool>,
    signal: Condvar,
}

impl ReleaseGate {
    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.released.lock().unwrap_or_else(|e| {
            error!("Release gate mutex poisoned: {e}");
            e.into_inner()
        })
    }

    fn release(&self) {
        *self.lock() = true;
        self.signal.notify_all();
    }

    fn is_released(&self) -> bool {
        *self.lock()
    }

    fn wait(&self) {
        let mut released = self.lock();
        while !*released {
            released = self.signal.wait(released).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct SyntheticDevice {
    width: u32,
    height: u32,
    fps: u32,
    sequence: u64,
    options: SyntheticOptions,
    gate: Arc<ReleaseGate>,
    counters: Arc<Counters>,
}

impl SyntheticDevice {
    /// Horizontal bands that scroll by one row per frame
    fn pattern(&self) -> Vec<u8> {
        let row_len = self.width as usize * 3;
        let mut data = vec![0u8; row_len * self.height as usize];
        for (y, row) in data.chunks_exact_mut(row_len).enumerate() {
            row.fill((y as u64).wrapping_add(self.sequence) as u8);
        }
        data
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read_frame(&mut self) -> OurResult<Frame> {
        match self.options.block_reads {
            BlockMode::Never => {
                thread::sleep(Duration::from_secs(1) / self.fps.max(1));
            }
            BlockMode::UntilReleased => self.gate.wait(),
            BlockMode::Forever => loop {
                thread::park();
            },
        }
        if self.gate.is_released() {
            return Err(OurError::TransientRead("device released".to_string()));
        }

        self.sequence += 1;
        if let Some(every) = self.options.fail_every {
            if every > 0 && self.sequence % every == 0 {
                return Err(OurError::TransientRead(format!(
                    "synthetic read {} dropped",
                    self.sequence
                )));
            }
        }
        Frame::new(self.height, self.width, 3, self.pattern())
    }

    fn apply_format(&mut self, width: u32, height: u32, fps: u32) -> OurResult<()> {
        self.width = width;
        self.height = height;
        self.fps = fps;
        Ok(())
    }

    fn report(&self) -> DeviceReport {
        DeviceReport {
            fps: Some(f64::from(self.fps)),
            width: Some(self.width),
            height: Some(self.height),
        }
    }

    fn release_handle(&self) -> Option<ReleaseHandle> {
        let gate = self.gate.clone();
        let counters = self.counters.clone();
        Some(Arc::new(move || {
            counters.releases.fetch_add(1, Ordering::SeqCst);
            gate.release();
        }))
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.counters.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}
