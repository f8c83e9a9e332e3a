//! Synchronous facade over the render engine
//!
//! Every entry point takes an [`OperationPermit`] as proof that the caller
//! holds the operation gate; the client itself never touches the gate.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use super::buffer::NativeBuffer;
use super::engine::{
    CALLBACK_ABORT, CallbackResult, DisplayCallback, EngineCode, EngineParam, FrameGeometry,
    PixelFormat, RenderEngine,
};
use super::error::{RenderError, Result};
use super::gate::{OperationGate, OperationPermit, Outcome, WaitPolicy};
use super::page::PageImage;
use super::progress::{OpenEndedProgress, ProgressSink};
use crate::settings::RenderSettings;

const PROGRAM_NAME: &str = "gs";
const FRAME_FORMAT: PixelFormat = PixelFormat::Rgb8;

/// Collects engine frames into owned page images, in callback order.
struct FrameCollector<'a> {
    dpi: u32,
    geometry: Option<FrameGeometry>,
    frame: NativeBuffer,
    images: Vec<PageImage>,
    failure: Option<RenderError>,
    progress: Option<(&'a dyn ProgressSink, OpenEndedProgress)>,
}

impl<'a> FrameCollector<'a> {
    fn new(dpi: u32, progress: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            dpi,
            geometry: None,
            frame: NativeBuffer::empty(),
            images: Vec::new(),
            failure: None,
            progress: progress.map(|sink| (sink, OpenEndedProgress::new())),
        }
    }

    fn fail(&mut self, error: RenderError) -> CallbackResult {
        warn!("Aborting engine run: {error}");
        self.failure = Some(error);
        Err(RenderError::EngineError {
            code: CALLBACK_ABORT,
        })
    }

    fn finish(mut self, status: std::result::Result<(), EngineCode>) -> Result<Vec<PageImage>> {
        self.frame.release();
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        status.map_err(|code| RenderError::EngineError { code })?;
        Ok(self.images)
    }
}

impl DisplayCallback for FrameCollector<'_> {
    fn on_size(&mut self, geometry: &FrameGeometry, frame: NativeBuffer) -> CallbackResult {
        if geometry.format != FRAME_FORMAT {
            return self.fail(RenderError::InvalidArgument(format!(
                "unexpected frame format {:?}",
                geometry.format
            )));
        }
        self.frame.release();
        self.geometry = Some(*geometry);
        self.frame = frame;
        Ok(())
    }

    fn on_page(&mut self, _copies: i32, _flush: bool) -> CallbackResult {
        let Some(geometry) = self.geometry else {
            return self.fail(RenderError::InvalidArgument(
                "page reported before frame size".to_string(),
            ));
        };

        match PageImage::copy_from_frame(&geometry, &self.frame, self.dpi) {
            Ok(image) => {
                debug!(
                    "Captured page {} ({}x{} @ {} dpi)",
                    self.images.len() + 1,
                    image.width(),
                    image.height(),
                    self.dpi
                );
                self.images.push(image);
            }
            Err(e) => return self.fail(e),
        }

        if let Some((sink, progress)) = self.progress.as_mut() {
            sink.report(progress.advance());
        }
        Ok(())
    }

    fn on_close(&mut self) -> CallbackResult {
        self.frame.release();
        self.geometry = None;
        Ok(())
    }
}

/// Thin synchronous wrapper that runs the engine and drains its frames.
pub struct RenderEngineClient {
    engine: Mutex<Box<dyn RenderEngine>>,
    settings: RenderSettings,
}

impl RenderEngineClient {
    #[must_use]
    pub fn new(engine: Box<dyn RenderEngine>, settings: RenderSettings) -> Self {
        Self {
            engine: Mutex::new(engine),
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    fn engine(&self) -> MutexGuard<'_, Box<dyn RenderEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn display_args() -> Vec<String> {
        vec![
            PROGRAM_NAME.to_string(),
            "-sDEVICE=display".to_string(),
            "-dNOPAUSE".to_string(),
            "-dFirstPage=1".to_string(),
            format!("-dDisplayFormat={}", FRAME_FORMAT.display_format()),
        ]
    }

    fn start_display_session(&self, engine: &mut dyn RenderEngine) -> Result<()> {
        engine.exit();
        engine
            .init(&Self::display_args())
            .map_err(|code| RenderError::EngineError { code })?;

        let alpha_bits = if self.settings.antialiasing { 4 } else { 1 };
        for name in ["TextAlphaBits", "GraphicsAlphaBits"] {
            set_param(engine, name, &EngineParam::Int(alpha_bits))?;
        }
        Ok(())
    }

    /// Renders the whole file at the low resolution, one image per page.
    ///
    /// Starts a fresh engine session; callback order defines page numbering.
    pub fn run_low_res(
        &self,
        _permit: &OperationPermit<'_>,
        file: &Path,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<Vec<PageImage>> {
        let mut engine = self.engine();
        self.start_display_session(&mut **engine)?;
        set_param(
            &mut **engine,
            "HWResolution",
            &EngineParam::resolution(self.settings.low_dpi),
        )?;

        let mut collector = FrameCollector::new(self.settings.low_dpi, progress);
        let status = engine.run_file(file, &mut collector);
        let images = collector.finish(status)?;
        info!(
            "Low resolution pass over {file:?} produced {} pages",
            images.len()
        );
        Ok(images)
    }

    /// Renders exactly the pages in `pages` at `dpi`.
    pub fn run_high_res(
        &self,
        permit: &OperationPermit<'_>,
        file: &Path,
        pages: RangeInclusive<usize>,
        dpi: u32,
    ) -> Result<Vec<PageImage>> {
        self.run_range(permit, file, pages, dpi)
    }

    /// Same contract as [`run_high_res`](Self::run_high_res), for the zoom tier.
    pub fn run_zoom(
        &self,
        permit: &OperationPermit<'_>,
        file: &Path,
        pages: RangeInclusive<usize>,
        dpi: u32,
    ) -> Result<Vec<PageImage>> {
        self.run_range(permit, file, pages, dpi)
    }

    fn run_range(
        &self,
        _permit: &OperationPermit<'_>,
        file: &Path,
        pages: RangeInclusive<usize>,
        dpi: u32,
    ) -> Result<Vec<PageImage>> {
        let (first, last) = (*pages.start(), *pages.end());
        if first == 0 || last < first {
            return Err(RenderError::InvalidArgument(format!(
                "bad page range {first}..={last}"
            )));
        }
        if dpi == 0 {
            return Err(RenderError::InvalidArgument("zero resolution".to_string()));
        }

        let mut engine = self.engine();
        if !engine.is_initialized() {
            self.start_display_session(&mut **engine)?;
        }
        set_param(&mut **engine, "HWResolution", &EngineParam::resolution(dpi))?;
        set_param(&mut **engine, "FirstPage", &EngineParam::Int(page_param(first)?))?;
        set_param(&mut **engine, "LastPage", &EngineParam::Int(page_param(last)?))?;

        let mut collector = FrameCollector::new(dpi, None);
        let status = engine.run_file(file, &mut collector);
        let images = collector.finish(status)?;

        let expected = last - first + 1;
        if images.len() != expected {
            return Err(RenderError::PageRangeMismatch {
                expected,
                actual: images.len(),
            });
        }
        debug!("Rendered pages {first}..={last} of {file:?} at {dpi} dpi");
        Ok(images)
    }

    /// Converts `input` to PDF at `output` with the engine's PDF writer.
    ///
    /// Uses a dedicated session that is torn down afterwards.
    pub fn distill(&self, _permit: &OperationPermit<'_>, input: &Path, output: &Path) -> Result<()> {
        let args = vec![
            PROGRAM_NAME.to_string(),
            "-sDEVICE=pdfwrite".to_string(),
            "-dNOPAUSE".to_string(),
            "-dBATCH".to_string(),
            "-dFirstPage=1".to_string(),
            format!("-dDisplayFormat={}", FRAME_FORMAT.display_format()),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "-f".to_string(),
            input.to_string_lossy().into_owned(),
        ];

        let mut engine = self.engine();
        engine.exit();
        let status = engine.init(&args);
        engine.exit();
        status.map_err(|code| RenderError::EngineError { code })?;
        info!("Distilled {input:?} into {output:?}");
        Ok(())
    }

    /// Ends the engine session, if any.
    pub fn close(&self, _permit: &OperationPermit<'_>) {
        self.engine().exit();
    }
}

impl Drop for RenderEngineClient {
    fn drop(&mut self) {
        self.engine
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .exit();
    }
}

fn set_param(engine: &mut dyn RenderEngine, name: &str, value: &EngineParam) -> Result<()> {
    engine.set_param(name, value).map_err(|code| {
        warn!("Failed to set {name} (code = {code})");
        RenderError::EngineError { code }
    })
}

fn page_param(page: usize) -> Result<i32> {
    i32::try_from(page).map_err(|_| RenderError::InvalidArgument(format!("page {page} too large")))
}

/// Shared access to one engine session: the gate plus the client behind it.
#[derive(Clone)]
pub struct EngineHandle {
    gate: Arc<OperationGate>,
    client: Arc<RenderEngineClient>,
}

impl EngineHandle {
    /// Wraps `engine` behind a new gate.
    pub fn new(engine: Box<dyn RenderEngine>, settings: RenderSettings) -> Result<Self> {
        Self::with_gate(Arc::new(OperationGate::new()), engine, settings)
    }

    /// Wraps `engine` behind an existing gate.
    pub fn with_gate(
        gate: Arc<OperationGate>,
        engine: Box<dyn RenderEngine>,
        settings: RenderSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            gate,
            client: Arc::new(RenderEngineClient::new(engine, settings)),
        })
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<OperationGate> {
        &self.gate
    }

    #[must_use]
    pub fn client(&self) -> &RenderEngineClient {
        &self.client
    }

    #[must_use]
    pub fn settings(&self) -> &RenderSettings {
        self.client.settings()
    }

    /// Converts PostScript/XPS `input` into a PDF.
    ///
    /// Without `output` a temporary file is created and kept.
    pub fn distill(
        &self,
        policy: WaitPolicy,
        input: &Path,
        output: Option<&Path>,
    ) -> Result<Outcome<PathBuf>> {
        if !input.exists() {
            return Err(RenderError::FileNotFound(input.to_path_buf()));
        }

        let Outcome::Completed(permit) = self.gate.acquire(policy, "EngineHandle::distill")? else {
            return Ok(Outcome::InProgress);
        };

        let output = match output {
            Some(path) => path.to_path_buf(),
            None => {
                let prefix = input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "distilled".to_string());
                let file = tempfile::Builder::new()
                    .prefix(&prefix)
                    .suffix(".pdf")
                    .tempfile()?;
                let (_, path) = file.keep().map_err(|e| RenderError::Io(e.error))?;
                path
            }
        };

        self.client.distill(&permit, input, &output)?;
        Ok(Outcome::Completed(output))
    }

    /// Ends the engine session once the gate is free under `policy`.
    pub fn shutdown(&self, policy: WaitPolicy) -> Result<Outcome<()>> {
        let Outcome::Completed(permit) = self.gate.acquire(policy, "EngineHandle::shutdown")? else {
            return Ok(Outcome::InProgress);
        };
        self.client.close(&permit);
        Ok(Outcome::Completed(()))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("gate", &self.gate)
            .field("settings", self.client.settings())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::mock::MockEngine;

    fn handle(pages: usize) -> (EngineHandle, crate::render::mock::MockProbe) {
        let engine = MockEngine::new(pages);
        let probe = engine.probe();
        let handle = EngineHandle::new(Box::new(engine), RenderSettings::default()).unwrap();
        (handle, probe)
    }

    #[test]
    fn low_res_pass_numbers_pages_in_callback_order() {
        let (handle, _) = handle(3);
        let permit = handle.gate().acquire(WaitPolicy::Wait, "test").unwrap().completed().unwrap();

        let images = handle.client().run_low_res(&permit, Path::new("a.ps"), None).unwrap();
        let values: Vec<u8> = images.iter().map(|i| i.pixel(0, 0).unwrap()[0]).collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(images.iter().all(|i| i.dpi() == 20));
    }

    #[test]
    fn range_run_reports_mismatch() {
        let (handle, probe) = handle(5);
        let permit = handle.gate().acquire(WaitPolicy::Wait, "test").unwrap().completed().unwrap();
        probe.set_missing_pages(2);

        let result = handle.client().run_high_res(&permit, Path::new("a.ps"), 2..=4, 72);
        assert!(matches!(
            result,
            Err(RenderError::PageRangeMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn range_run_initialises_session_on_demand() {
        let (handle, probe) = handle(5);
        let permit = handle.gate().acquire(WaitPolicy::Wait, "test").unwrap().completed().unwrap();

        let images = handle
            .client()
            .run_zoom(&permit, Path::new("a.ps"), 4..=5, 144)
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dpi(), 144);
        assert_eq!(probe.init_count(), 1);
        assert_eq!(probe.last_param("FirstPage"), Some(EngineParam::Int(4)));
        assert_eq!(probe.last_param("LastPage"), Some(EngineParam::Int(5)));
    }

    #[test]
    fn bad_ranges_are_rejected() {
        let (handle, probe) = handle(5);
        let permit = handle.gate().acquire(WaitPolicy::Wait, "test").unwrap().completed().unwrap();
        let client = handle.client();

        #[allow(clippy::reversed_empty_ranges)]
        let reversed = 3..=2;
        assert!(client.run_high_res(&permit, Path::new("a"), 0..=1, 72).is_err());
        assert!(client.run_high_res(&permit, Path::new("a"), reversed, 72).is_err());
        assert!(client.run_high_res(&permit, Path::new("a"), 1..=1, 0).is_err());
        assert_eq!(probe.run_count(), 0);
    }

    #[test]
    fn engine_code_is_surfaced() {
        let (handle, probe) = handle(2);
        let permit = handle.gate().acquire(WaitPolicy::Wait, "test").unwrap().completed().unwrap();
        probe.fail_next_run(-3);

        let result = handle.client().run_low_res(&permit, Path::new("a"), None);
        assert!(matches!(result, Err(RenderError::EngineError { code: -3 })));
    }

    #[test]
    fn shutdown_respects_busy_gate() {
        let (handle, probe) = handle(1);
        {
            let permit = handle.gate().acquire(WaitPolicy::Wait, "test").unwrap().completed().unwrap();
            handle.client().run_low_res(&permit, Path::new("a"), None).unwrap();
            assert!(handle.shutdown(WaitPolicy::ReturnIfBusy).unwrap().is_in_progress());
        }
        assert_eq!(handle.shutdown(WaitPolicy::Wait).unwrap(), Outcome::Completed(()));
        assert_eq!(probe.exit_count(), 1);
    }
}
