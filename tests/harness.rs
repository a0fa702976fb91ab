//! Acquisition against the producer named by the harness environment.
//!
//! Set `HARVESTERS_TEST_TARGET` (e.g. `mock://2` or `/dev`),
//! `HARVESTERS_LOGGING_CONFIG` and `HARVESTERS_LOG_BUFFER` to run it; the
//! test passes without doing anything when any of them is missing.

use std::sync::Arc;
use std::time::Duration;

use cam_acquire::logging::{self, LogConfig};
use cam_acquire::{DefaultLoader, DeviceRegistry, HarnessEnv};
use serial_test::serial;

const FRAMES_PER_DEVICE: usize = 10;
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

#[test]
#[serial]
fn test_harness_multiple_devices() {
    let Some(env) = HarnessEnv::from_env() else {
        println!("harness environment not set, skipping");
        return;
    };
    logging::init(&LogConfig::from(&env)).expect("logging should initialise");

    let mut registry = DeviceRegistry::new(Arc::new(DefaultLoader::default()));
    registry
        .add_source(&env.target)
        .expect("target should load");
    registry.update().expect("update should list devices");

    let count = registry.device_info_list().len().min(2);
    assert!(count > 0, "no device behind {}", env.target.display());

    let sessions: Vec<_> = (0..count)
        .map(|index| {
            let session = registry.create(index).expect("create should succeed");
            session.start(true).expect("start should succeed");
            session
        })
        .collect();

    let mut delivered = vec![0_usize; sessions.len()];
    while delivered.iter().any(|&n| n <= FRAMES_PER_DEVICE) {
        for (session, n) in sessions.iter().zip(delivered.iter_mut()) {
            let frame = session
                .fetch(Some(FETCH_TIMEOUT))
                .expect("fetch should deliver a frame");
            println!(
                "{}: frame {} ({} bytes)",
                session.device_info().id,
                frame.frame_id(),
                frame.bytes().len()
            );
            *n += 1;
        }
    }

    for session in &sessions {
        session.destroy().expect("destroy should succeed");
    }
    assert!(registry.reset().is_clean());
    for session in &sessions {
        assert!(!session.is_worker_running());
        assert!(session.fetch(Some(Duration::from_millis(10))).is_err());
    }
}
