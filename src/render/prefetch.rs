//! Background high resolution prefetch around the visible page
//!
//! One scheduler thread runs per open document. Each pass re-reads the view,
//! evicts high tier images that fell out of the window and loads the missing
//! ones nearest first. Between passes the thread sleeps on a coalescing
//! navigation signal.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use log::{debug, info, warn};

use super::document::Document;
use super::error::Result;
use super::gate::{Outcome, WaitPolicy};
use super::progress::{ProgressSink, fraction_percent};

const SCHEDULER_THREAD_NAME: &str = "prefetch-scheduler";

/// Current view of a document, as seen by the scheduler.
pub trait ViewState: Send + Sync {
    /// 1-based visible page, or `None` once no document is shown.
    fn current_page(&self) -> Option<usize>;
}

/// Minimal thread-safe [`ViewState`].
#[derive(Debug)]
pub struct ViewCursor {
    page: AtomicUsize,
    loaded: AtomicBool,
}

impl ViewCursor {
    #[must_use]
    pub fn new(page: usize) -> Self {
        Self {
            page: AtomicUsize::new(page),
            loaded: AtomicBool::new(true),
        }
    }

    pub fn set_page(&self, page: usize) {
        self.page.store(page, Ordering::Release);
    }

    /// Marks the document as no longer shown.
    pub fn close(&self) {
        self.loaded.store(false, Ordering::Release);
    }
}

impl ViewState for ViewCursor {
    fn current_page(&self) -> Option<usize> {
        self.loaded
            .load(Ordering::Acquire)
            .then(|| self.page.load(Ordering::Acquire))
    }
}

/// Payload-free "the view changed" notification.
///
/// Bursts collapse into a single pending wake.
#[derive(Clone, Debug)]
pub struct NavigationSignal {
    tx: Sender<()>,
}

impl NavigationSignal {
    pub fn page_changed(&self) {
        self.notify();
    }

    pub fn scroll_changed(&self) {
        self.notify();
    }

    fn notify(&self) {
        // A full channel already holds a pending wake.
        let _ = self.tx.try_send(());
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerState {
    #[default]
    Idle,
    Computing,
    WaitingForSignal,
    Stopped,
}

/// Pages to keep at high resolution around `current`, nearest first.
///
/// Candidates outside `1..=size` are dropped, so a current page far outside
/// the document yields an empty window.
#[must_use]
pub fn prefetch_window(current: usize, radius: usize, size: usize) -> Vec<usize> {
    let valid = |page: &usize| (1..=size).contains(page);
    let mut pages: Vec<usize> = Some(current).filter(valid).into_iter().collect();
    for distance in 1..=radius {
        if let Some(before) = current.checked_sub(distance).filter(valid) {
            pages.push(before);
        }
        if let Some(after) = current.checked_add(distance).filter(valid) {
            pages.push(after);
        }
    }
    pages
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SchedulerState>,
    stop: AtomicBool,
    passes: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: SchedulerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

pub struct PrefetchScheduler {
    document: Arc<Document>,
    view: Arc<dyn ViewState>,
    progress: Option<Arc<dyn ProgressSink>>,
    radius: usize,
    rx: Receiver<()>,
    shared: Arc<Shared>,
}

impl PrefetchScheduler {
    /// Starts the scheduler thread. It runs a first pass right away.
    ///
    /// `radius` defaults to the document's configured prefetch radius.
    pub fn spawn(
        document: Arc<Document>,
        view: Arc<dyn ViewState>,
        progress: Option<Arc<dyn ProgressSink>>,
        radius: Option<usize>,
    ) -> Result<PrefetchHandle> {
        let (tx, rx) = flume::bounded(1);
        let shared = Arc::new(Shared::default());
        let radius = radius.unwrap_or(document.engine().settings().prefetch_radius);
        let scheduler = Self {
            document,
            view,
            progress,
            radius,
            rx,
            shared: Arc::clone(&shared),
        };

        let thread = std::thread::Builder::new()
            .name(SCHEDULER_THREAD_NAME.to_string())
            .spawn(move || scheduler.run())?;

        Ok(PrefetchHandle {
            signal: NavigationSignal { tx },
            shared,
            thread: Some(thread),
        })
    }

    fn run(self) {
        info!(
            "Prefetch scheduler started for {} (radius {})",
            self.document.name(),
            self.radius
        );
        loop {
            if self.shared.stopped() {
                break;
            }
            let Some(current) = self.view.current_page() else {
                debug!("View closed, stopping prefetch");
                break;
            };
            if self.document.is_empty() {
                debug!("Document unloaded, stopping prefetch");
                break;
            }

            self.shared.set_state(SchedulerState::Computing);
            self.pass(current);
            self.shared.passes.fetch_add(1, Ordering::AcqRel);

            if self.shared.stopped() {
                break;
            }
            self.shared.set_state(SchedulerState::WaitingForSignal);
            if self.rx.recv().is_err() {
                break;
            }
        }
        self.shared.set_state(SchedulerState::Stopped);
        info!("Prefetch scheduler stopped for {}", self.document.name());
    }

    fn pass(&self, current: usize) {
        let size = self.document.size();
        let window = prefetch_window(current, self.radius, size);
        self.evict_outside(&window, size);

        let missing: Vec<usize> = window
            .iter()
            .copied()
            .filter(|&page| !self.document.is_high_res_loaded(page))
            .collect();
        let total = window.len();
        let mut done = total - missing.len();
        self.report(fraction_percent(done, total));

        for page in missing {
            if self.shared.stopped() || !self.rx.is_empty() {
                debug!("Navigation changed, restarting prefetch pass");
                return;
            }
            self.load(page);
            done += 1;
            self.report(fraction_percent(done, total));
        }
    }

    /// Loads one page without stalling behind other operations.
    fn load(&self, page: usize) {
        loop {
            match self
                .document
                .load_high_res_page(WaitPolicy::ReturnIfBusy, page)
            {
                Ok(Outcome::Completed(())) => return,
                Ok(Outcome::InProgress) => {
                    self.document.gate().wait_idle();
                    if self.shared.stopped() || self.document.is_high_res_loaded(page) {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Prefetch of page {page} failed: {e}");
                    return;
                }
            }
        }
    }

    fn evict_outside(&self, window: &[usize], size: usize) {
        for page in 1..=size {
            if window.contains(&page) || !self.document.is_high_res_loaded(page) {
                continue;
            }
            if let Err(e) = self.document.unload_high_res(page, page) {
                warn!("Failed to evict page {page}: {e}");
            }
        }
    }

    fn report(&self, percent: u8) {
        if let Some(sink) = &self.progress {
            sink.report(percent);
        }
    }
}

/// Owner of a running scheduler. Dropping it stops and joins the thread.
pub struct PrefetchHandle {
    signal: NavigationSignal,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl PrefetchHandle {
    /// Signal to notify on page or scroll changes.
    #[must_use]
    pub fn signal(&self) -> NavigationSignal {
        self.signal.clone()
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Number of passes finished so far.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Requests a cooperative stop and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.signal.notify();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Prefetch scheduler thread panicked");
            }
        }
    }
}

impl Drop for PrefetchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_nearest_first() {
        assert_eq!(prefetch_window(5, 2, 10), vec![5, 4, 6, 3, 7]);
    }

    #[test]
    fn window_is_clipped_to_document() {
        assert_eq!(prefetch_window(1, 2, 10), vec![1, 2, 3]);
        assert_eq!(prefetch_window(10, 2, 10), vec![10, 9, 8]);
        assert_eq!(prefetch_window(1, 2, 1), vec![1]);
        assert!(prefetch_window(1, 2, 0).is_empty());
    }

    #[test]
    fn out_of_range_current_keeps_only_valid_neighbours() {
        assert_eq!(prefetch_window(0, 2, 10), vec![1, 2]);
        assert_eq!(prefetch_window(11, 2, 10), vec![10, 9]);
        assert!(prefetch_window(15, 2, 10).is_empty());
        assert!(prefetch_window(1, 2, 0).is_empty());
    }

    #[test]
    fn cursor_reports_nothing_after_close() {
        let cursor = ViewCursor::new(3);
        assert_eq!(cursor.current_page(), Some(3));
        cursor.set_page(4);
        assert_eq!(cursor.current_page(), Some(4));
        cursor.close();
        assert_eq!(cursor.current_page(), None);
    }

    #[test]
    fn signal_coalesces_bursts() {
        let (tx, rx) = flume::bounded(1);
        let signal = NavigationSignal { tx };
        for _ in 0..10 {
            signal.page_changed();
            signal.scroll_changed();
        }
        assert_eq!(rx.len(), 1);
    }
}
