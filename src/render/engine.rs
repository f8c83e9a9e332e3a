//! Render engine boundary
//!
//! The engine is an external, stateful interpreter. It is driven with
//! command-line style arguments and typed parameters, and reports every
//! finished page through a [`DisplayCallback`] in document order.

use std::path::Path;

use super::buffer::NativeBuffer;
use super::error::RenderError;

/// Raw status code returned by the engine. Zero is success.
pub type EngineCode = i32;

/// Code a callback returns to the engine to abort the current run.
pub const CALLBACK_ABORT: EngineCode = -1;

// Display format flags understood by the display device.
const DISPLAY_COLORS_RGB: u32 = 1 << 2;
const DISPLAY_ALPHA_NONE: u32 = 0;
const DISPLAY_DEPTH_8: u32 = 1 << 11;
const DISPLAY_BIGENDIAN: u32 = 0;
const DISPLAY_TOPFIRST: u32 = 0;

/// Pixel layout of frames produced by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Interleaved RGB, 8 bits per channel, big-endian, top row first
    Rgb8,
}

impl PixelFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 => 3,
        }
    }

    /// Value passed to the engine as `-dDisplayFormat`.
    #[must_use]
    pub const fn display_format(self) -> u32 {
        match self {
            Self::Rgb8 => {
                DISPLAY_COLORS_RGB
                    | DISPLAY_ALPHA_NONE
                    | DISPLAY_DEPTH_8
                    | DISPLAY_BIGENDIAN
                    | DISPLAY_TOPFIRST
            }
        }
    }

    #[must_use]
    pub fn from_display_format(format: u32) -> Option<Self> {
        (format == Self::Rgb8.display_format()).then_some(Self::Rgb8)
    }
}

/// Dimensions of one engine frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including alignment padding
    pub stride: usize,
    pub format: PixelFormat,
}

impl FrameGeometry {
    #[must_use]
    pub fn new(width: u32, height: u32, stride: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride,
            format,
        }
    }

    /// Smallest stride for `width`, padded to a 4-byte boundary.
    #[must_use]
    pub fn aligned_stride(width: u32, format: PixelFormat) -> usize {
        let row = width as usize * format.bytes_per_pixel();
        row.div_ceil(4) * 4
    }

    /// Bytes of pixel data in a row, excluding padding.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Total frame size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.stride.saturating_mul(self.height as usize)
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.stride < self.row_bytes() {
            return Err(RenderError::InvalidArgument(format!(
                "stride {} shorter than row of {} bytes",
                self.stride,
                self.row_bytes()
            )));
        }
        Ok(())
    }
}

/// Typed parameter value handed to the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineParam {
    Bool(bool),
    Int(i32),
    Float(f32),
    /// String value, passed verbatim
    String(String),
    /// PostScript fragment parsed by the engine, e.g. `[72 72]`
    Parsed(String),
}

impl EngineParam {
    /// `HWResolution` value for a square resolution.
    #[must_use]
    pub fn resolution(dpi: u32) -> Self {
        Self::Parsed(format!("[{dpi} {dpi}]"))
    }
}

/// Outcome of a display callback. An error aborts the current engine run.
pub type CallbackResult = Result<(), RenderError>;

/// Display events raised by the engine while it renders.
///
/// Every method defaults to a no-op so implementers only handle the events
/// they care about. `frame` buffers passed to [`on_size`](Self::on_size)
/// belong to the engine and are only valid until the next size event or the
/// end of the run: copy pixels out in [`on_page`](Self::on_page).
pub trait DisplayCallback {
    fn on_open(&mut self) -> CallbackResult {
        Ok(())
    }

    fn on_presize(&mut self, _geometry: &FrameGeometry) -> CallbackResult {
        Ok(())
    }

    fn on_size(&mut self, _geometry: &FrameGeometry, _frame: NativeBuffer) -> CallbackResult {
        Ok(())
    }

    fn on_sync(&mut self) -> CallbackResult {
        Ok(())
    }

    /// A page is complete in the current frame buffer.
    fn on_page(&mut self, _copies: i32, _flush: bool) -> CallbackResult {
        Ok(())
    }

    fn on_update(&mut self, _x: i32, _y: i32, _width: i32, _height: i32) -> CallbackResult {
        Ok(())
    }

    fn on_preclose(&mut self) -> CallbackResult {
        Ok(())
    }

    fn on_close(&mut self) -> CallbackResult {
        Ok(())
    }
}

/// One session of the external render engine.
///
/// Implementations are not reentrant; callers serialize access through the
/// operation gate.
pub trait RenderEngine: Send {
    /// Starts a session with command-line style arguments (`args[0]` is the
    /// program name).
    fn init(&mut self, args: &[String]) -> Result<(), EngineCode>;

    /// True between a successful [`init`](Self::init) and [`exit`](Self::exit).
    fn is_initialized(&self) -> bool;

    fn set_param(&mut self, name: &str, value: &EngineParam) -> Result<(), EngineCode>;

    /// Interprets `path`, reporting each produced page to `display` in order.
    fn run_file(&mut self, path: &Path, display: &mut dyn DisplayCallback)
    -> Result<(), EngineCode>;

    /// Ends the session. Idempotent.
    fn exit(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_display_format_matches_engine_flags() {
        assert_eq!(PixelFormat::Rgb8.display_format(), 0x804);
        assert_eq!(
            PixelFormat::from_display_format(0x804),
            Some(PixelFormat::Rgb8)
        );
        assert_eq!(PixelFormat::from_display_format(0x802), None);
    }

    #[test]
    fn stride_is_padded_to_four_bytes() {
        assert_eq!(FrameGeometry::aligned_stride(1, PixelFormat::Rgb8), 4);
        assert_eq!(FrameGeometry::aligned_stride(4, PixelFormat::Rgb8), 12);
        assert_eq!(FrameGeometry::aligned_stride(5, PixelFormat::Rgb8), 16);
    }

    #[test]
    fn short_stride_is_rejected() {
        let geometry = FrameGeometry::new(10, 2, 20, PixelFormat::Rgb8);
        assert!(geometry.validate().is_err());

        let geometry = FrameGeometry::new(10, 2, 32, PixelFormat::Rgb8);
        assert!(geometry.validate().is_ok());
        assert_eq!(geometry.byte_len(), 64);
    }

    #[test]
    fn resolution_param_is_parsed_array() {
        assert_eq!(
            EngineParam::resolution(72),
            EngineParam::Parsed("[72 72]".to_string())
        );
    }
}
