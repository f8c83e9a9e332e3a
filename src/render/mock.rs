//! Scriptable in-process engine for tests
//!
//! [`MockEngine`] renders flat frames whose every byte is the page number, so
//! tests can tell which page landed where. A cloned [`MockProbe`] observes the
//! calls the engine received and scripts failures.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::buffer::NativeBuffer;
use super::engine::{
    CALLBACK_ABORT, DisplayCallback, EngineCode, EngineParam, FrameGeometry, PixelFormat,
    RenderEngine,
};

/// Code returned when the engine is driven without a session.
pub const NOT_INITIALIZED: EngineCode = -100;

#[derive(Debug, Default)]
struct Script {
    fail_init: Option<EngineCode>,
    /// Runs still to succeed before failing with the code.
    fail_run: Option<(usize, EngineCode)>,
    missing_pages: usize,
    page_delay: Duration,
}

#[derive(Debug, Default)]
struct Record {
    init_args: Vec<Vec<String>>,
    exits: usize,
    runs: Vec<RunRecord>,
    params: Vec<(String, EngineParam)>,
    active_runs: usize,
    max_concurrent_runs: usize,
}

/// One call to [`RenderEngine::run_file`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRecord {
    pub path: PathBuf,
    pub first: usize,
    pub last: usize,
    pub dpi: u32,
}

/// Shared view into a [`MockEngine`], usable after the engine is boxed away.
#[derive(Clone, Debug, Default)]
pub struct MockProbe {
    script: Arc<Mutex<Script>>,
    record: Arc<Mutex<Record>>,
}

impl MockProbe {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following `init` fail with `code`; `None` clears it.
    pub fn fail_init(&self, code: Option<EngineCode>) {
        self.script().fail_init = code;
    }

    /// Makes the next `run_file` fail with `code` before producing pages.
    pub fn fail_next_run(&self, code: EngineCode) {
        self.fail_run_after(0, code);
    }

    /// Lets `successes` runs through, then fails the one after with `code`.
    pub fn fail_run_after(&self, successes: usize, code: EngineCode) {
        self.script().fail_run = Some((successes, code));
    }

    /// Drops the last `count` pages of every run.
    pub fn set_missing_pages(&self, count: usize) {
        self.script().missing_pages = count;
    }

    /// Sleeps for `delay` before each produced page.
    pub fn set_page_delay(&self, delay: Duration) {
        self.script().page_delay = delay;
    }

    #[must_use]
    pub fn init_count(&self) -> usize {
        self.record().init_args.len()
    }

    #[must_use]
    pub fn init_args(&self) -> Vec<Vec<String>> {
        self.record().init_args.clone()
    }

    #[must_use]
    pub fn exit_count(&self) -> usize {
        self.record().exits
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.record().runs.len()
    }

    #[must_use]
    pub fn runs(&self) -> Vec<RunRecord> {
        self.record().runs.clone()
    }

    /// Most recent value set for `name`, across sessions.
    #[must_use]
    pub fn last_param(&self, name: &str) -> Option<EngineParam> {
        self.record()
            .params
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Highest number of `run_file` calls observed executing at once.
    #[must_use]
    pub fn max_concurrent_runs(&self) -> usize {
        self.record().max_concurrent_runs
    }
}

/// In-process stand-in for the render engine.
#[derive(Debug)]
pub struct MockEngine {
    page_count: usize,
    initialized: bool,
    params: HashMap<String, EngineParam>,
    probe: MockProbe,
}

impl MockEngine {
    /// An engine that renders documents of `page_count` pages.
    #[must_use]
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            initialized: false,
            params: HashMap::new(),
            probe: MockProbe::default(),
        }
    }

    #[must_use]
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    fn int_param(&self, name: &str) -> Option<usize> {
        match self.params.get(name) {
            Some(EngineParam::Int(v)) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    fn resolution(&self) -> u32 {
        match self.params.get("HWResolution") {
            Some(EngineParam::Parsed(value)) => value
                .trim_matches(|c| c == '[' || c == ']')
                .split_whitespace()
                .next()
                .and_then(|dpi| dpi.parse().ok())
                .unwrap_or(72),
            _ => 72,
        }
    }

    fn write_pdf(args: &[String]) -> Result<(), EngineCode> {
        let output = args
            .iter()
            .position(|a| a == "-o")
            .and_then(|i| args.get(i + 1))
            .ok_or(CALLBACK_ABORT)?;
        fs::write(output, b"%PDF-1.7\n%%EOF\n").map_err(|_| CALLBACK_ABORT)
    }
}

impl RenderEngine for MockEngine {
    fn init(&mut self, args: &[String]) -> Result<(), EngineCode> {
        self.probe.record().init_args.push(args.to_vec());
        if let Some(code) = self.probe.script().fail_init {
            return Err(code);
        }
        self.params.clear();
        if args.iter().any(|a| a == "-sDEVICE=pdfwrite") {
            Self::write_pdf(args)?;
        }
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn set_param(&mut self, name: &str, value: &EngineParam) -> Result<(), EngineCode> {
        if !self.initialized {
            return Err(NOT_INITIALIZED);
        }
        self.probe
            .record()
            .params
            .push((name.to_string(), value.clone()));
        self.params.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn run_file(
        &mut self,
        path: &Path,
        display: &mut dyn DisplayCallback,
    ) -> Result<(), EngineCode> {
        if !self.initialized {
            return Err(NOT_INITIALIZED);
        }

        let dpi = self.resolution();
        let first = self.int_param("FirstPage").unwrap_or(1).max(1);
        let last = self
            .int_param("LastPage")
            .unwrap_or(self.page_count)
            .min(self.page_count);
        let (fail, missing, delay) = {
            let mut script = self.probe.script();
            let fail = match script.fail_run.take() {
                Some((0, code)) => Some(code),
                Some((successes, code)) => {
                    script.fail_run = Some((successes - 1, code));
                    None
                }
                None => None,
            };
            (
                fail,
                script.missing_pages,
                script.page_delay,
            )
        };

        {
            let mut record = self.probe.record();
            record.runs.push(RunRecord {
                path: path.to_path_buf(),
                first,
                last,
                dpi,
            });
            record.active_runs += 1;
            record.max_concurrent_runs = record.max_concurrent_runs.max(record.active_runs);
        }

        let result = match fail {
            Some(code) => Err(code),
            None => emit_pages(display, first, last.saturating_sub(missing), dpi, delay),
        };

        self.probe.record().active_runs -= 1;
        result
    }

    fn exit(&mut self) {
        if self.initialized {
            self.initialized = false;
            self.probe.record().exits += 1;
        }
    }
}

fn emit_pages(
    display: &mut dyn DisplayCallback,
    first: usize,
    last: usize,
    dpi: u32,
    delay: Duration,
) -> Result<(), EngineCode> {
    let width = dpi.max(1);
    let height = (dpi * 4 / 3).max(1);
    let format = PixelFormat::Rgb8;
    let geometry = FrameGeometry::new(
        width,
        height,
        FrameGeometry::aligned_stride(width, format),
        format,
    );

    let mut frame = vec![0u8; geometry.byte_len()];
    let len = frame.len();
    let ptr = frame.as_mut_ptr();

    let abort = |_| CALLBACK_ABORT;
    display.on_open().map_err(abort)?;
    display.on_presize(&geometry).map_err(abort)?;
    // SAFETY: `frame` outlives the run and is only written through `ptr`.
    let buffer = unsafe { NativeBuffer::from_engine(ptr, len) };
    display.on_size(&geometry, buffer).map_err(abort)?;

    for page in first..=last {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        // SAFETY: `ptr` addresses `len` live bytes of `frame`.
        unsafe { std::ptr::write_bytes(ptr, page as u8, len) };
        display.on_sync().map_err(abort)?;
        display.on_page(1, false).map_err(abort)?;
    }

    display.on_preclose().map_err(abort)?;
    display.on_close().map_err(abort)?;
    drop(frame);
    Ok(())
}
