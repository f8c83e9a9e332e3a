pub mod render;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use render::{Document, EngineHandle, Outcome, RenderError, WaitPolicy};
pub use settings::RenderSettings;
