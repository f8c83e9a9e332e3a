//! Engine-driven page rendering
//!
//! Callers open a [`Document`] through an [`EngineHandle`]; every engine
//! invocation is serialized by the shared [`OperationGate`].

pub mod buffer;
pub mod client;
pub mod document;
pub mod engine;
pub mod error;
pub mod gate;
#[cfg(feature = "ghostscript")]
pub mod ghostscript;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod page;
pub mod prefetch;
pub mod progress;

pub use buffer::{NativeBuffer, live_owned_buffers};
pub use client::{EngineHandle, RenderEngineClient};
pub use document::{AsyncDispatch, Document, PageSnapshot};
pub use engine::{
    CallbackResult, DisplayCallback, EngineCode, EngineParam, FrameGeometry, PixelFormat,
    RenderEngine,
};
pub use error::{BufferError, RenderError, Result};
pub use gate::{OperationGate, OperationPermit, Outcome, WaitPolicy};
#[cfg(feature = "ghostscript")]
pub use ghostscript::GhostscriptEngine;
pub use page::{Page, PageImage, PageVariant, Tier};
pub use prefetch::{
    NavigationSignal, PrefetchHandle, PrefetchScheduler, SchedulerState, ViewCursor, ViewState,
};
pub use progress::{OpenEndedProgress, ProgressSink};
