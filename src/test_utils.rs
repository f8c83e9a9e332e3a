//! Fixtures shared by unit and integration tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::render::mock::{MockEngine, MockProbe};
use crate::render::{Document, EngineHandle, Outcome, ProgressSink, WaitPolicy};
use crate::settings::RenderSettings;

/// A mock-backed engine plus a source file on disk.
pub struct Fixture {
    pub dir: TempDir,
    pub file: PathBuf,
    pub engine: EngineHandle,
    pub probe: MockProbe,
}

impl Fixture {
    pub fn new(pages: usize) -> Self {
        Self::with_settings(pages, RenderSettings::default())
    }

    pub fn with_settings(pages: usize, settings: RenderSettings) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("sample.ps");
        std::fs::write(&file, b"%!PS-Adobe-3.0\n").expect("write sample");

        let mock = MockEngine::new(pages);
        let probe = mock.probe();
        let engine = EngineHandle::new(Box::new(mock), settings).expect("engine handle");
        Self {
            dir,
            file,
            engine,
            probe,
        }
    }

    /// Opens the sample file, waiting for the gate.
    pub fn open(&self) -> Document {
        match Document::open(&self.engine, &self.file, None, WaitPolicy::Wait) {
            Ok(Outcome::Completed(document)) => document,
            Ok(Outcome::InProgress) => panic!("open skipped under Wait"),
            Err(e) => panic!("open failed: {e}"),
        }
    }

    pub fn open_shared(&self) -> Arc<Document> {
        Arc::new(self.open())
    }
}

/// Progress sink remembering every reported value.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    values: Mutex<Vec<u8>>,
}

impl RecordingProgress {
    pub fn values(&self) -> Vec<u8> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, percent: u8) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(percent);
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
