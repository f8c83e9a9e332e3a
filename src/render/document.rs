//! Paged document backed by the render engine
//!
//! A [`Document`] owns one [`Page`] per page of the source file. Opening it
//! renders every page at the low resolution; higher tiers are loaded and
//! evicted per page range afterwards. Every engine call goes through the
//! operation gate and validation always happens before the gate is touched.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use super::client::EngineHandle;
use super::error::{RenderError, Result};
use super::gate::{OperationGate, Outcome, WaitPolicy};
use super::page::{Page, PageImage, Tier};
use super::progress::ProgressSink;

const LOADER_THREAD_NAME: &str = "document-loader";

/// File extensions the engine can interpret.
const SUPPORTED_EXTENSIONS: [&str; 6] = ["ps", "eps", "pdf", "xps", "pxl", "pcl"];

/// Whether an asynchronous open was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncDispatch {
    /// The load runs in the background and reports through the callback.
    Dispatched,
    /// The gate was busy and the caller asked not to wait.
    InProgress,
}

/// Immutable view of one page at the time it was taken.
#[derive(Clone, Debug)]
pub struct PageSnapshot {
    pub number: usize,
    pub tiers: Vec<Tier>,
    pub zoom: Option<f64>,
    pub displayable: Option<Arc<PageImage>>,
}

pub struct Document {
    path: PathBuf,
    engine: EngineHandle,
    pages: RwLock<Vec<Page>>,
}

impl Document {
    /// Opens `path`, rendering every page at the low resolution.
    ///
    /// Returns [`Outcome::InProgress`] when `policy` is
    /// [`WaitPolicy::ReturnIfBusy`] and another operation holds the gate.
    pub fn open(
        engine: &EngineHandle,
        path: impl AsRef<Path>,
        progress: Option<&dyn ProgressSink>,
        policy: WaitPolicy,
    ) -> Result<Outcome<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RenderError::FileNotFound(path.to_path_buf()));
        }

        let Outcome::Completed(permit) = engine.gate().acquire(policy, "Document::open")? else {
            return Ok(Outcome::InProgress);
        };

        let images = engine
            .client()
            .run_low_res(&permit, path, progress)
            .map_err(|e| {
                warn!("Failed to load {path:?}: {e}");
                RenderError::init_failed(e.to_string())
            })?;
        if images.is_empty() {
            return Err(RenderError::init_failed(format!(
                "engine produced no pages for {}",
                path.display()
            )));
        }
        drop(permit);

        let pages: Vec<Page> = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| Page::new(i + 1, image))
            .collect();
        if let Some(sink) = progress {
            sink.report(100);
        }
        info!("Opened {path:?} with {} pages", pages.len());

        Ok(Outcome::Completed(Self {
            path: path.to_path_buf(),
            engine: engine.clone(),
            pages: RwLock::new(pages),
        }))
    }

    /// Opens `path` on a background thread and hands the result to `callback`.
    ///
    /// The gate is checked under `policy` before the thread starts; the load
    /// itself waits for the gate.
    pub fn open_async<F>(
        engine: &EngineHandle,
        path: impl Into<PathBuf>,
        progress: Option<Arc<dyn ProgressSink>>,
        policy: WaitPolicy,
        callback: F,
    ) -> Result<AsyncDispatch>
    where
        F: FnOnce(Result<Self>) + Send + 'static,
    {
        let path = path.into();
        if !path.exists() {
            return Err(RenderError::FileNotFound(path));
        }
        if !engine.gate().check(policy, "Document::open_async")? {
            return Ok(AsyncDispatch::InProgress);
        }

        let engine = engine.clone();
        std::thread::Builder::new()
            .name(LOADER_THREAD_NAME.to_string())
            .spawn(move || {
                let result = Self::open(&engine, &path, progress.as_deref(), WaitPolicy::Wait)
                    .and_then(|outcome| {
                        outcome.completed().ok_or_else(|| RenderError::OperationInProgress {
                            caller: "Document::open_async".to_string(),
                        })
                    });
                callback(result);
            })?;
        Ok(AsyncDispatch::Dispatched)
    }

    /// Whether `path` should be converted to PDF before opening.
    ///
    /// Fails for missing files and for extensions the engine does not read.
    pub fn should_distill(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Err(RenderError::FileNotFound(path.to_path_buf()));
        }
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .filter(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
            .ok_or_else(|| RenderError::UnsupportedFile(path.to_path_buf()))?;
        Ok(extension != "pdf")
    }

    fn pages(&self) -> RwLockReadGuard<'_, Vec<Page>> {
        self.pages.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn pages_mut(&self) -> RwLockWriteGuard<'_, Vec<Page>> {
        self.pages.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the source, without directories.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.pages().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages().is_empty()
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<OperationGate> {
        self.engine.gate()
    }

    #[must_use]
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    #[must_use]
    pub fn page(&self, number: usize) -> Option<PageSnapshot> {
        let pages = self.pages();
        let page = pages.get(number.checked_sub(1)?)?;
        Some(PageSnapshot {
            number: page.number(),
            tiers: Tier::ALL.into_iter().filter(|t| page.has(*t)).collect(),
            zoom: page.variant(Tier::Zoomed).map(|v| v.zoom),
            displayable: page.displayable_image(),
        })
    }

    /// Best loaded image of page `number`.
    ///
    /// The image is shared with the page. Evicting the tier or unloading the
    /// document frees its pixels only once every clone handed out here has
    /// been dropped.
    #[must_use]
    pub fn displayable_image(&self, number: usize) -> Option<Arc<PageImage>> {
        let pages = self.pages();
        pages.get(number.checked_sub(1)?)?.displayable_image()
    }

    #[must_use]
    pub fn is_high_res_loaded(&self, number: usize) -> bool {
        number
            .checked_sub(1)
            .and_then(|i| self.pages().get(i).map(|p| p.has(Tier::High)))
            .unwrap_or(false)
    }

    fn check_range(&self, start: usize, end: usize) -> Result<RangeInclusive<usize>> {
        let size = self.size();
        if start == 0 || start > end || end > size {
            return Err(RenderError::PageOutOfRange { start, end, size });
        }
        Ok(start..=end)
    }

    /// Renders pages `start..=end` into their high tier.
    pub fn load_high_res(&self, policy: WaitPolicy, start: usize, end: usize) -> Result<Outcome<()>> {
        let range = self.check_range(start, end)?;
        let Outcome::Completed(permit) = self.gate().acquire(policy, "Document::load_high_res")?
        else {
            return Ok(Outcome::InProgress);
        };

        let dpi = self.engine.settings().high_dpi;
        let images = self
            .engine
            .client()
            .run_high_res(&permit, &self.path, range.clone(), dpi)?;
        self.assign(range, images, Tier::High, 1.0);
        Ok(Outcome::Completed(()))
    }

    pub fn load_high_res_page(&self, policy: WaitPolicy, page: usize) -> Result<Outcome<()>> {
        self.load_high_res(policy, page, page)
    }

    /// Renders an arbitrary set of pages under a single gate acquisition.
    ///
    /// Contiguous runs share one engine invocation.
    pub fn load_high_res_list(&self, policy: WaitPolicy, pages: &[usize]) -> Result<Outcome<()>> {
        for &page in pages {
            self.check_range(page, page)?;
        }
        let runs = contiguous_runs(pages);
        if runs.is_empty() {
            return Ok(Outcome::Completed(()));
        }

        let Outcome::Completed(permit) =
            self.gate().acquire(policy, "Document::load_high_res_list")?
        else {
            return Ok(Outcome::InProgress);
        };

        // Nothing is assigned until every run has succeeded.
        let dpi = self.engine.settings().high_dpi;
        let mut rendered: Vec<(RangeInclusive<usize>, Vec<PageImage>)> =
            Vec::with_capacity(runs.len());
        for run in runs {
            let images = self
                .engine
                .client()
                .run_high_res(&permit, &self.path, run.clone(), dpi)?;
            rendered.push((run, images));
        }
        for (run, images) in rendered {
            self.assign(run, images, Tier::High, 1.0);
        }
        Ok(Outcome::Completed(()))
    }

    /// Drops the high tier of pages `start..=end`. Needs no gate.
    pub fn unload_high_res(&self, start: usize, end: usize) -> Result<usize> {
        self.evict(start, end, Tier::High)
    }

    /// Drops the zoomed tier of pages `start..=end`. Needs no gate.
    pub fn unload_zoomed(&self, start: usize, end: usize) -> Result<usize> {
        self.evict(start, end, Tier::Zoomed)
    }

    /// Renders `page` and its neighbours at `zoom` times the high resolution
    /// into their zoomed tier.
    pub fn zoom_area(&self, policy: WaitPolicy, page: usize, zoom: f64) -> Result<Outcome<()>> {
        self.check_range(page, page)?;
        let neighbours = self.engine.settings().zoom_neighbours;
        let start = page.saturating_sub(neighbours).max(1);
        let end = page.saturating_add(neighbours).min(self.size());
        self.zoom_range(policy, start..=end, zoom, "Document::zoom_area")
    }

    /// Renders only `page` at `zoom` times the high resolution.
    pub fn zoom_page(&self, policy: WaitPolicy, page: usize, zoom: f64) -> Result<Outcome<()>> {
        self.check_range(page, page)?;
        self.zoom_range(policy, page..=page, zoom, "Document::zoom_page")
    }

    fn zoom_range(
        &self,
        policy: WaitPolicy,
        range: RangeInclusive<usize>,
        zoom: f64,
        caller: &str,
    ) -> Result<Outcome<()>> {
        let dpi = zoom_dpi(self.engine.settings().high_dpi, zoom)?;
        let Outcome::Completed(permit) = self.gate().acquire(policy, caller)? else {
            return Ok(Outcome::InProgress);
        };

        let images = self
            .engine
            .client()
            .run_zoom(&permit, &self.path, range.clone(), dpi)?;
        debug!("Zoomed pages {range:?} of {:?} to {zoom}x ({dpi} dpi)", self.path);
        self.assign(range, images, Tier::Zoomed, zoom);
        Ok(Outcome::Completed(()))
    }

    /// Releases every image and empties the document.
    ///
    /// The engine session is closed too unless another operation is running.
    pub fn unload(&self) {
        let mut pages = self.pages_mut();
        for page in pages.iter_mut() {
            page.unload_all();
        }
        let count = pages.len();
        pages.clear();
        drop(pages);

        match self.engine.shutdown(WaitPolicy::ReturnIfBusy) {
            Ok(Outcome::Completed(())) => {}
            Ok(Outcome::InProgress) => debug!("Engine busy, leaving session open"),
            Err(e) => warn!("Failed to close engine session: {e}"),
        }
        info!("Unloaded {:?} ({count} pages)", self.path);
    }

    fn assign(&self, range: RangeInclusive<usize>, images: Vec<PageImage>, tier: Tier, zoom: f64) {
        let mut pages = self.pages_mut();
        for (number, image) in range.zip(images) {
            match pages.get_mut(number - 1) {
                Some(page) => page.set_variant(tier, image, zoom),
                // The document was unloaded while the engine ran.
                None => break,
            }
        }
    }

    fn evict(&self, start: usize, end: usize, tier: Tier) -> Result<usize> {
        let range = self.check_range(start, end)?;
        let mut pages = self.pages_mut();
        let evicted = pages[range.start() - 1..*range.end()]
            .iter_mut()
            .map(|page| page.unload(tier))
            .filter(|&unloaded| unloaded)
            .count();
        if evicted > 0 {
            debug!("Evicted {evicted} {tier:?} images in {range:?}");
        }
        Ok(evicted)
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

fn zoom_dpi(high_dpi: u32, zoom: f64) -> Result<u32> {
    if !zoom.is_finite() || zoom <= 0.0 {
        return Err(RenderError::InvalidArgument(format!(
            "zoom factor must be positive, got {zoom}"
        )));
    }
    let dpi = (f64::from(high_dpi) * zoom).floor();
    if dpi > f64::from(u32::MAX) {
        return Err(RenderError::InvalidArgument(format!(
            "zoom factor {zoom} too large"
        )));
    }
    Ok((dpi as u32).max(1))
}

/// Sorted, deduplicated pages grouped into contiguous ranges.
fn contiguous_runs(pages: &[usize]) -> Vec<RangeInclusive<usize>> {
    let mut sorted = pages.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<RangeInclusive<usize>> = Vec::new();
    for page in sorted {
        match runs.last_mut() {
            Some(run) if *run.end() + 1 == page => *run = *run.start()..=page,
            _ => runs.push(page..=page),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_group_contiguous_pages() {
        assert_eq!(contiguous_runs(&[5, 1, 2, 2, 3, 7, 8]), vec![1..=3, 5..=5, 7..=8]);
        assert!(contiguous_runs(&[]).is_empty());
    }

    #[test]
    fn zoom_dpi_scales_high_resolution() {
        assert_eq!(zoom_dpi(72, 2.0).unwrap(), 144);
        assert_eq!(zoom_dpi(72, 1.3).unwrap(), 93);
        assert_eq!(zoom_dpi(72, 0.001).unwrap(), 1);
        assert!(zoom_dpi(72, 0.0).is_err());
        assert!(zoom_dpi(72, -1.0).is_err());
        assert!(zoom_dpi(72, f64::NAN).is_err());
        assert!(zoom_dpi(72, f64::INFINITY).is_err());
    }

    #[test]
    fn distill_check_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let ps = dir.path().join("doc.PS");
        let pdf = dir.path().join("doc.pdf");
        let txt = dir.path().join("doc.txt");
        for path in [&ps, &pdf, &txt] {
            std::fs::write(path, b"x").unwrap();
        }

        assert!(Document::should_distill(&ps).unwrap());
        assert!(!Document::should_distill(&pdf).unwrap());
        assert!(matches!(
            Document::should_distill(&txt),
            Err(RenderError::UnsupportedFile(_))
        ));
        assert!(matches!(
            Document::should_distill(&dir.path().join("missing.ps")),
            Err(RenderError::FileNotFound(_))
        ));
    }
}
