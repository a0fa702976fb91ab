//! In-process mock producer for testing without hardware.
//!
//! [`MockProducer`] lists a fixed set of [`MockCamera`]s and enforces
//! exclusive opens. Each camera can be told to misbehave through
//! [`MockBehavior`] so the capture loop's failure paths can be exercised.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AcquireError, CaptureError, Result};
use crate::traits::{
    DeviceHandle, DeviceInfo, Format, FourCC, FrameBuffer, Producer, SourceLoader,
};

/// Test pattern written into every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Eight vertical YUYV color bars.
    ColorBars,
    /// Solid color with the given Y, U, V values.
    Solid(u8, u8, u8),
}

/// How a mock camera responds to `fill_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Produces a frame every frame interval.
    Healthy,
    /// Never produces a frame; every call times out transiently.
    Stalled,
    /// Every n-th capture attempt fails transiently.
    TransientEvery(u32),
    /// Delivers n frames, then reports a disconnect.
    FatalAfter(u64),
    /// Refuses to open.
    Unreachable,
}

/// Description of one simulated camera.
#[derive(Debug, Clone)]
pub struct MockCamera {
    id: String,
    model: String,
    source: PathBuf,
    format: Format,
    pattern: TestPattern,
    frame_interval: Duration,
    behavior: MockBehavior,
}

impl MockCamera {
    /// A healthy 640x480 YUYV camera producing color bars at ~30 fps.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            model: "Mock Camera".to_owned(),
            source: PathBuf::from("mock://"),
            format: Format::new(640, 480, FourCC::YUYV),
            pattern: TestPattern::ColorBars,
            frame_interval: Duration::from_millis(33),
            behavior: MockBehavior::Healthy,
        }
    }

    /// Set the frame geometry.
    #[must_use]
    pub const fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the test pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the time one capture takes.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Set the failure behavior.
    #[must_use]
    pub const fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Descriptor as the producer lists it.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            vendor: "mock".to_owned(),
            model: self.model.clone(),
            serial_number: format!("MOCK-{}", self.id),
            source: self.source.clone(),
        }
    }

    /// Open the camera directly, bypassing a producer.
    pub fn into_handle(self) -> Box<dyn DeviceHandle> {
        Box::new(MockHandle::new(self, None))
    }
}

struct MockHandle {
    camera: MockCamera,
    frames: u64,
    attempts: u64,
    opened_at: Instant,
    open_set: Option<Arc<Mutex<HashSet<String>>>>,
}

impl MockHandle {
    fn new(camera: MockCamera, open_set: Option<Arc<Mutex<HashSet<String>>>>) -> Self {
        Self {
            camera,
            frames: 0,
            attempts: 0,
            opened_at: Instant::now(),
            open_set,
        }
    }
}

impl DeviceHandle for MockHandle {
    fn fill_buffer(&mut self, buffer: &mut FrameBuffer) -> std::result::Result<(), CaptureError> {
        self.attempts += 1;
        thread::sleep(self.camera.frame_interval);

        match self.camera.behavior {
            MockBehavior::Stalled => {
                return Err(CaptureError::Transient("no frame within poll interval".to_owned()))
            }
            MockBehavior::TransientEvery(n) if n > 0 && self.attempts % u64::from(n) == 0 => {
                return Err(CaptureError::Transient(format!(
                    "frame {} dropped",
                    self.attempts
                )))
            }
            MockBehavior::FatalAfter(n) if self.frames >= n => {
                return Err(CaptureError::Fatal(format!("{} disconnected", self.camera.id)))
            }
            _ => {}
        }

        let format = self.camera.format;
        buffer.data.resize(format.size as usize, 0);
        write_pattern(&mut buffer.data, format.width, self.camera.pattern);
        buffer.metadata.device_sequence = self.frames;
        buffer.metadata.timestamp = self.opened_at.elapsed();
        buffer.metadata.bytes_used = buffer.data.len();
        buffer.metadata.format = Some(format);
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(open_set) = self.open_set.take() {
            open_set.lock().remove(&self.camera.id);
            debug!(device = %self.camera.id, "mock camera closed");
        }
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write a YUYV test pattern; `data` holds rows of `width` pixels.
fn write_pattern(data: &mut [u8], width: u32, pattern: TestPattern) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let row_bytes = (width as usize * 2).max(4);
    let bar_bytes = (row_bytes / 8).max(4);

    for (offset, pair) in data.chunks_exact_mut(4).enumerate() {
        let (y, u, v) = match pattern {
            TestPattern::Solid(y, u, v) => (y, u, v),
            TestPattern::ColorBars => {
                let column = (offset * 4) % row_bytes;
                BARS.get(column / bar_bytes)
                    .copied()
                    .unwrap_or((16, 128, 128))
            }
        };
        pair.copy_from_slice(&[y, u, y, v]);
    }
}

/// Producer exposing a fixed list of mock cameras.
pub struct MockProducer {
    source: PathBuf,
    cameras: Vec<MockCamera>,
    open: Arc<Mutex<HashSet<String>>>,
    fail_listing: AtomicBool,
}

impl MockProducer {
    /// Producer at `source` exposing `cameras`.
    pub fn new<P: Into<PathBuf>>(source: P, cameras: Vec<MockCamera>) -> Self {
        let source = source.into();
        let cameras = cameras
            .into_iter()
            .map(|mut camera| {
                camera.source.clone_from(&source);
                camera
            })
            .collect();
        Self {
            source,
            cameras,
            open: Arc::new(Mutex::new(HashSet::new())),
            fail_listing: AtomicBool::new(false),
        }
    }

    /// Producer with `count` healthy cameras named `mock-0`, `mock-1`, ...
    pub fn with_cameras<P: Into<PathBuf>>(source: P, count: usize, frame_interval: Duration) -> Self {
        let cameras = (0..count)
            .map(|index| MockCamera::new(format!("mock-{index}")).with_frame_interval(frame_interval))
            .collect();
        Self::new(source, cameras)
    }

    /// Source path this producer was created for.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Make `list_devices` fail until reset.
    pub fn set_listing_failure(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Whether a camera is currently held open.
    pub fn is_open(&self, id: &str) -> bool {
        self.open.lock().contains(id)
    }
}

impl Producer for MockProducer {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(AcquireError::Discovery(format!(
                "{} is not responding",
                self.source.display()
            )));
        }
        Ok(self.cameras.iter().map(MockCamera::info).collect())
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn DeviceHandle>> {
        let camera = self
            .cameras
            .iter()
            .find(|camera| camera.id == info.id)
            .ok_or_else(|| AcquireError::DeviceUnreachable {
                device: info.id.clone(),
                reason: "not listed by this producer".to_owned(),
            })?;

        if camera.behavior == MockBehavior::Unreachable {
            return Err(AcquireError::DeviceUnreachable {
                device: info.id.clone(),
                reason: "no response".to_owned(),
            });
        }

        let mut open = self.open.lock();
        if !open.insert(camera.id.clone()) {
            return Err(AcquireError::DeviceBusy(camera.id.clone()));
        }
        drop(open);

        Ok(Box::new(MockHandle::new(
            camera.clone(),
            Some(Arc::clone(&self.open)),
        )))
    }
}

/// Loader resolving registered paths to mock producers.
#[derive(Default)]
pub struct MockLoader {
    producers: Mutex<HashMap<PathBuf, Arc<MockProducer>>>,
}

impl MockLoader {
    /// Empty loader; every path fails to load until registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `producer` under its source path.
    pub fn register(&self, producer: Arc<MockProducer>) {
        self.producers
            .lock()
            .insert(producer.source().to_path_buf(), producer);
    }
}

impl SourceLoader for MockLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Producer>> {
        self.producers
            .lock()
            .get(path)
            .map(|producer| Arc::clone(producer) as Arc<dyn Producer>)
            .ok_or_else(|| AcquireError::SourceLoad {
                path: path.to_path_buf(),
                reason: "no mock producer registered".to_owned(),
            })
    }
}
