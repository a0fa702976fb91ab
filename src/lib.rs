//! cam-acquire: multi-device image acquisition.
//!
//! A [`DeviceRegistry`] loads producer sources and discovers devices. Each
//! device opened through it becomes an [`AcquisitionSession`] with its own
//! bounded buffer pool and capture loop. Consumers fetch frames as
//! [`FetchHandle`]s that give their slot back to the pool on drop.
//!
//! Producers are abstracted behind the [`Producer`] and [`DeviceHandle`]
//! traits, enabling both production use with V4L2 hardware (`v4l2` feature)
//! and testing with the in-process [`mock`] producer.

pub mod capture;
pub mod config;
#[cfg(feature = "v4l2")]
pub mod device;
pub mod error;
pub mod loader;
pub mod logging;
pub mod mock;
pub mod pool;
pub mod registry;
pub mod session;
pub mod traits;

pub use capture::SessionStats;
pub use config::{AcquisitionConfig, HarnessEnv};
#[cfg(feature = "v4l2")]
pub use device::V4l2Producer;
pub use error::{AcquireError, CaptureError, Result};
pub use loader::DefaultLoader;
pub use pool::{FetchHandle, PoolStats};
pub use registry::{DeviceRegistry, ResetReport, UpdateReport};
pub use session::{AcquisitionSession, SessionState};
pub use traits::{
    DeviceHandle, DeviceInfo, Format, FourCC, FrameBuffer, FrameMetadata, Producer, SourceLoader,
};
