//! Device registry: producer sources, the device list and live sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AcquisitionConfig;
use crate::error::{AcquireError, Result};
use crate::session::{AcquisitionSession, SessionState};
use crate::traits::{DeviceInfo, Producer, SourceLoader};

struct Source {
    path: PathBuf,
    producer: Arc<dyn Producer>,
}

/// Result of a successful [`DeviceRegistry::update`].
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Devices in the new list.
    pub devices: usize,
    /// Sources that failed to enumerate and were left out.
    pub failures: Vec<(PathBuf, AcquireError)>,
}

/// Errors collected by [`DeviceRegistry::reset`].
#[derive(Debug, Default)]
pub struct ResetReport {
    /// Sessions torn down.
    pub sessions: usize,
    /// Device id and error for every session that had to be forced down.
    pub errors: Vec<(String, AcquireError)>,
}

impl ResetReport {
    /// Whether every session shut down cleanly.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Discovers devices and owns the sessions created from them.
///
/// Dropping the registry resets it.
pub struct DeviceRegistry {
    loader: Arc<dyn SourceLoader>,
    config: AcquisitionConfig,
    sources: Vec<Source>,
    devices: Vec<DeviceInfo>,
    sessions: Vec<AcquisitionSession>,
}

impl DeviceRegistry {
    /// Registry with default acquisition settings.
    pub fn new(loader: Arc<dyn SourceLoader>) -> Self {
        Self::with_config(loader, AcquisitionConfig::default())
    }

    /// Registry whose sessions use `config`.
    pub fn with_config(loader: Arc<dyn SourceLoader>, config: AcquisitionConfig) -> Self {
        Self {
            loader,
            config,
            sources: Vec::new(),
            devices: Vec::new(),
            sessions: Vec::new(),
        }
    }

    /// Load and register a producer source. Adding a path twice is a no-op.
    pub fn add_source<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.sources.iter().any(|source| source.path == path) {
            return Ok(());
        }
        let producer = self.loader.load(path)?;
        info!(source = %path.display(), "producer source added");
        self.sources.push(Source {
            path: path.to_path_buf(),
            producer,
        });
        Ok(())
    }

    /// Registered source paths, in registration order.
    pub fn sources(&self) -> impl Iterator<Item = &Path> {
        self.sources.iter().map(|source| source.path.as_path())
    }

    /// Rebuild the device list from every source.
    ///
    /// A failing source is skipped and reported; the list is only replaced
    /// when at least one source answered.
    pub fn update(&mut self) -> Result<UpdateReport> {
        if self.sources.is_empty() {
            return Err(AcquireError::Discovery("no producer source registered".to_owned()));
        }

        let mut devices = Vec::new();
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.producer.list_devices() {
                Ok(mut listed) => devices.append(&mut listed),
                Err(err) => {
                    warn!(source = %source.path.display(), error = %err, "device enumeration failed");
                    failures.push((source.path.clone(), err));
                }
            }
        }

        if failures.len() == self.sources.len() {
            let reasons: Vec<String> = failures
                .iter()
                .map(|(path, err)| format!("{}: {err}", path.display()))
                .collect();
            return Err(AcquireError::Discovery(reasons.join("; ")));
        }

        info!(devices = devices.len(), failed_sources = failures.len(), "device list updated");
        self.devices = devices;
        Ok(UpdateReport {
            devices: self.devices.len(),
            failures,
        })
    }

    /// Devices found by the last successful `update`.
    pub fn device_info_list(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Open the device at `index` and wrap it in an idle session.
    pub fn create(&mut self, index: usize) -> Result<AcquisitionSession> {
        let info = self
            .devices
            .get(index)
            .cloned()
            .ok_or(AcquireError::IndexOutOfRange {
                index,
                len: self.devices.len(),
            })?;

        self.sessions
            .retain(|session| session.state() != SessionState::Destroyed);
        if self
            .sessions
            .iter()
            .any(|session| session.device_info().id == info.id && session.device_info().source == info.source)
        {
            return Err(AcquireError::DeviceBusy(info.id));
        }

        let producer = self
            .sources
            .iter()
            .find(|source| source.path == info.source)
            .map(|source| Arc::clone(&source.producer))
            .ok_or_else(|| AcquireError::DeviceUnreachable {
                device: info.id.clone(),
                reason: format!("source {} is no longer registered", info.source.display()),
            })?;

        let device = producer.open_device(&info)?;
        info!(device = %info, "session created");
        let session = AcquisitionSession::new(info, device, self.config.clone());
        self.sessions.push(session.clone());
        Ok(session)
    }

    /// Sessions created by this registry that are not destroyed yet.
    pub fn live_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|session| session.state() != SessionState::Destroyed)
            .count()
    }

    /// Destroy every session, clear the device list and drop all sources.
    ///
    /// Never fails; sessions that could not shut down cleanly are listed in
    /// the report.
    pub fn reset(&mut self) -> ResetReport {
        let mut report = ResetReport::default();
        for session in self.sessions.drain(..) {
            report.sessions += 1;
            if let Err(err) = session.destroy() {
                warn!(device = %session.device_info().id, error = %err, "forced session teardown");
                report.errors.push((session.device_info().id.clone(), err));
            }
        }
        self.devices.clear();
        self.sources.clear();
        info!(sessions = report.sessions, errors = report.errors.len(), "registry reset");
        report
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if !self.sessions.is_empty() || !self.sources.is_empty() {
            self.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockCamera, MockLoader, MockProducer};
    use crate::error::CaptureError;
    use crate::traits::{DeviceHandle, Format, FourCC, FrameBuffer};
    use std::time::{Duration, Instant};

    fn camera(id: &str) -> MockCamera {
        MockCamera::new(id)
            .with_format(Format::new(16, 4, FourCC::YUYV))
            .with_frame_interval(Duration::from_millis(1))
    }

    fn registry_with(producers: Vec<MockProducer>) -> (DeviceRegistry, Vec<Arc<MockProducer>>) {
        let loader = Arc::new(MockLoader::new());
        let producers: Vec<Arc<MockProducer>> = producers.into_iter().map(Arc::new).collect();
        for producer in &producers {
            loader.register(Arc::clone(producer));
        }
        (DeviceRegistry::new(loader), producers)
    }

    #[test]
    fn test_update_without_sources_fails() {
        let (mut registry, _) = registry_with(vec![]);
        assert!(matches!(registry.update(), Err(AcquireError::Discovery(_))));
    }

    #[test]
    fn test_add_source_errors_and_idempotence() {
        let (mut registry, _) =
            registry_with(vec![MockProducer::new("mock://a", vec![camera("a0")])]);

        assert!(matches!(
            registry.add_source("mock://missing"),
            Err(AcquireError::SourceLoad { .. })
        ));
        registry.add_source("mock://a").expect("add");
        registry.add_source("mock://a").expect("add again");
        assert_eq!(registry.sources().count(), 1);

        let report = registry.update().expect("update");
        assert_eq!(report.devices, 1);
        assert_eq!(registry.device_info_list().len(), 1);
    }

    #[test]
    fn test_update_reports_failing_source() {
        let (mut registry, producers) = registry_with(vec![
            MockProducer::new("mock://a", vec![camera("a0"), camera("a1")]),
            MockProducer::new("mock://b", vec![camera("b0")]),
        ]);
        registry.add_source("mock://a").expect("add a");
        registry.add_source("mock://b").expect("add b");
        assert_eq!(registry.update().expect("update").devices, 3);

        let failing = producers.get(1).expect("producer b");
        failing.set_listing_failure(true);
        let report = registry.update().expect("partial update");
        assert_eq!(report.devices, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(registry.device_info_list().len(), 2);

        producers.first().expect("producer a").set_listing_failure(true);
        assert!(matches!(registry.update(), Err(AcquireError::Discovery(_))));
        // The previous list survives a total failure.
        assert_eq!(registry.device_info_list().len(), 2);
    }

    #[test]
    fn test_create_checks_index_and_exclusivity() {
        let (mut registry, producers) =
            registry_with(vec![MockProducer::new("mock://a", vec![camera("a0")])]);
        registry.add_source("mock://a").expect("add");
        registry.update().expect("update");

        assert!(matches!(
            registry.create(1),
            Err(AcquireError::IndexOutOfRange { index: 1, len: 1 })
        ));

        let session = registry.create(0).expect("create");
        assert!(matches!(registry.create(0), Err(AcquireError::DeviceBusy(_))));

        session.destroy().expect("destroy");
        assert!(!producers.first().expect("producer").is_open("a0"));
        let again = registry.create(0).expect("create after destroy");
        assert_eq!(again.state(), SessionState::Idle);
    }

    #[test]
    fn test_unreachable_device() {
        let (mut registry, _) = registry_with(vec![MockProducer::new(
            "mock://a",
            vec![camera("a0").with_behavior(MockBehavior::Unreachable)],
        )]);
        registry.add_source("mock://a").expect("add");
        registry.update().expect("update");
        assert!(matches!(
            registry.create(0),
            Err(AcquireError::DeviceUnreachable { .. })
        ));
    }

    #[test]
    fn test_reset_tears_down_running_sessions() {
        let (mut registry, producers) = registry_with(vec![MockProducer::new(
            "mock://a",
            vec![camera("a0"), camera("a1"), camera("a2")],
        )]);
        registry.add_source("mock://a").expect("add");
        registry.update().expect("update");

        let running = registry.create(0).expect("create");
        running.start(true).expect("start");
        let on_demand = registry.create(1).expect("create");
        on_demand.start(false).expect("start");
        let idle = registry.create(2).expect("create");
        let held = running.fetch(Some(Duration::from_secs(5))).expect("fetch");
        assert_eq!(registry.live_sessions(), 3);

        let report = registry.reset();
        assert_eq!(report.sessions, 3);
        assert!(report.is_clean());

        assert!(registry.device_info_list().is_empty());
        assert_eq!(registry.sources().count(), 0);
        assert_eq!(registry.live_sessions(), 0);
        for session in [&running, &on_demand, &idle] {
            assert_eq!(session.state(), SessionState::Destroyed);
            assert!(!session.is_worker_running());
            assert!(session.fetch(Some(Duration::from_millis(10))).is_err());
        }
        drop(held);

        let producer = producers.first().expect("producer");
        assert!(!producer.is_open("a0"));
        assert!(!producer.is_open("a1"));
        assert!(!producer.is_open("a2"));
        assert!(matches!(registry.update(), Err(AcquireError::Discovery(_))));
    }

    /// Device stuck in every capture for longer than the join timeout.
    struct StuckDevice;

    impl DeviceHandle for StuckDevice {
        fn fill_buffer(&mut self, buffer: &mut FrameBuffer) -> std::result::Result<(), CaptureError> {
            std::thread::sleep(Duration::from_millis(500));
            buffer.data.resize(4, 0);
            buffer.metadata.bytes_used = 4;
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct StuckProducer;

    impl Producer for StuckProducer {
        fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(vec![DeviceInfo {
                id: "stuck".to_owned(),
                vendor: "test".to_owned(),
                model: "stuck".to_owned(),
                serial_number: "0".to_owned(),
                source: PathBuf::from("stuck://"),
            }])
        }

        fn open_device(&self, _info: &DeviceInfo) -> Result<Box<dyn DeviceHandle>> {
            Ok(Box::new(StuckDevice))
        }
    }

    struct StuckLoader;

    impl SourceLoader for StuckLoader {
        fn load(&self, _path: &Path) -> Result<Arc<dyn Producer>> {
            Ok(Arc::new(StuckProducer))
        }
    }

    #[test]
    fn test_reset_detaches_stuck_worker() {
        let config = AcquisitionConfig {
            join_timeout: Duration::from_millis(20),
            ..AcquisitionConfig::default()
        };
        let mut registry = DeviceRegistry::with_config(Arc::new(StuckLoader), config);
        registry.add_source("stuck://").expect("add");
        registry.update().expect("update");
        let session = registry.create(0).expect("create");
        session.start(true).expect("start");
        std::thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        let report = registry.reset();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(report.sessions, 1);
        assert!(matches!(
            report.errors.as_slice(),
            [(device, AcquireError::WorkerUnresponsive { .. })] if device == "stuck"
        ));
        assert_eq!(session.state(), SessionState::Destroyed);
    }
}
