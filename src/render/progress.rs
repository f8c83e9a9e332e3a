//! Progress reporting to external sinks

/// Receives percent-complete notifications (0-100).
///
/// Calls are fire-and-forget and must not block.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(u8) + Send + Sync,
{
    fn report(&self, percent: u8) {
        self(percent);
    }
}

/// Progress of a load whose page count is unknown up front.
///
/// Each produced page halves the remaining distance to 100; the load reports
/// 100 explicitly when it finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenEndedProgress {
    percent: u8,
}

impl OpenEndedProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Advances after one page and returns the new percentage.
    pub fn advance(&mut self) -> u8 {
        self.percent += (100 - self.percent) / 2;
        self.percent
    }

    pub fn finish(&mut self) -> u8 {
        self.percent = 100;
        self.percent
    }
}

/// Percentage of `done` out of `total`, 100 for an empty total.
#[must_use]
pub fn fraction_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
