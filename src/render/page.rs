//! Pages and their resolution-tiered images

use std::sync::Arc;

use image::RgbImage;
use rayon::prelude::*;

use super::buffer::NativeBuffer;
use super::engine::{FrameGeometry, PixelFormat};
use super::error::{BufferError, RenderError};

/// Frames above this many bytes are compacted in parallel.
const PARALLEL_COMPACT_THRESHOLD: usize = 1 << 20;

/// Resolution class of a page image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Thumbnail produced when the document is opened
    Low,
    /// Full resolution, loaded on demand
    High,
    /// Magnified rendering with its own zoom factor
    Zoomed,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Low, Tier::High, Tier::Zoomed];

    const fn slot(self) -> usize {
        match self {
            Self::Low => 0,
            Self::High => 1,
            Self::Zoomed => 2,
        }
    }
}

/// Decoded page image holding an owned copy of an engine frame.
pub struct PageImage {
    geometry: FrameGeometry,
    dpi: u32,
    pixels: NativeBuffer,
}

impl PageImage {
    /// Copies a frame out of engine-owned memory.
    pub fn copy_from_frame(
        geometry: &FrameGeometry,
        frame: &NativeBuffer,
        dpi: u32,
    ) -> Result<Self, RenderError> {
        geometry.validate()?;
        let needed = geometry.byte_len();
        let source = frame.as_slice()?;
        if source.len() < needed {
            return Err(BufferError::OutOfBounds {
                index: needed.saturating_sub(1),
                len: source.len(),
            }
            .into());
        }

        let pixels = NativeBuffer::from_slice(&source[..needed])?;
        Ok(Self {
            geometry: *geometry,
            dpi,
            pixels,
        })
    }

    /// Wraps an already owned pixel buffer.
    pub fn from_buffer(
        geometry: FrameGeometry,
        dpi: u32,
        pixels: NativeBuffer,
    ) -> Result<Self, RenderError> {
        geometry.validate()?;
        if pixels.len() < geometry.byte_len() {
            return Err(BufferError::OutOfBounds {
                index: geometry.byte_len().saturating_sub(1),
                len: pixels.len(),
            }
            .into());
        }
        Ok(Self {
            geometry,
            dpi,
            pixels,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.geometry.stride
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.geometry.format
    }

    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Resolution the image was rendered at.
    #[must_use]
    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    #[must_use]
    pub fn pixels(&self) -> &NativeBuffer {
        &self.pixels
    }

    /// RGB value at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Result<[u8; 3], BufferError> {
        if x >= self.geometry.width || y >= self.geometry.height {
            return Err(BufferError::OutOfBounds {
                index: y as usize * self.geometry.stride + x as usize * 3,
                len: self.pixels.len(),
            });
        }
        let offset = y as usize * self.geometry.stride + x as usize * 3;
        Ok([
            self.pixels.read(offset)?,
            self.pixels.read(offset + 1)?,
            self.pixels.read(offset + 2)?,
        ])
    }

    /// Pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> Result<&[u8], BufferError> {
        let data = self.pixels.as_slice()?;
        let start = y as usize * self.geometry.stride;
        let end = start + self.geometry.row_bytes();
        if y >= self.geometry.height || end > data.len() {
            return Err(BufferError::OutOfBounds {
                index: start,
                len: data.len(),
            });
        }
        Ok(&data[start..end])
    }

    /// Converts to a tightly packed [`RgbImage`], dropping row padding.
    pub fn to_rgb_image(&self) -> Result<RgbImage, RenderError> {
        let data = self.pixels.as_slice()?;
        let row_bytes = self.geometry.row_bytes();
        let stride = self.geometry.stride;
        let mut packed = vec![0u8; row_bytes * self.geometry.height as usize];

        if row_bytes == 0 {
            return RgbImage::from_raw(self.geometry.width, self.geometry.height, packed)
                .ok_or_else(|| RenderError::InvalidArgument("empty image".to_string()));
        }

        if packed.len() >= PARALLEL_COMPACT_THRESHOLD {
            packed
                .par_chunks_mut(row_bytes)
                .enumerate()
                .for_each(|(y, row)| {
                    let start = y * stride;
                    row.copy_from_slice(&data[start..start + row_bytes]);
                });
        } else {
            for (y, row) in packed.chunks_exact_mut(row_bytes).enumerate() {
                let start = y * stride;
                row.copy_from_slice(&data[start..start + row_bytes]);
            }
        }

        RgbImage::from_raw(self.geometry.width, self.geometry.height, packed).ok_or_else(|| {
            RenderError::InvalidArgument("pixel data does not match dimensions".to_string())
        })
    }
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("width", &self.geometry.width)
            .field("height", &self.geometry.height)
            .field("stride", &self.geometry.stride)
            .field("dpi", &self.dpi)
            .finish_non_exhaustive()
    }
}

/// An image stored at one tier of a page.
#[derive(Clone, Debug)]
pub struct PageVariant {
    pub tier: Tier,
    pub image: Arc<PageImage>,
    /// Magnification relative to the high tier; 1.0 for low and high
    pub zoom: f64,
}

/// One page of a document with up to one image per tier.
#[derive(Debug)]
pub struct Page {
    number: usize,
    variants: [Option<PageVariant>; 3],
}

impl Page {
    /// Creates page `number` (1-based) from its low resolution image.
    #[must_use]
    pub fn new(number: usize, low: PageImage) -> Self {
        let mut page = Self {
            number,
            variants: [None, None, None],
        };
        page.set_variant(Tier::Low, low, 1.0);
        page
    }

    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }

    /// Stores `image` at `tier`, releasing whatever was there first.
    pub fn set_variant(&mut self, tier: Tier, image: PageImage, zoom: f64) {
        self.variants[tier.slot()] = None;
        self.variants[tier.slot()] = Some(PageVariant {
            tier,
            image: Arc::new(image),
            zoom,
        });
    }

    pub fn set_high_res(&mut self, image: PageImage) {
        self.set_variant(Tier::High, image, 1.0);
    }

    pub fn set_zoomed(&mut self, image: PageImage, zoom: f64) {
        self.set_variant(Tier::Zoomed, image, zoom);
    }

    #[must_use]
    pub fn variant(&self, tier: Tier) -> Option<&PageVariant> {
        self.variants[tier.slot()].as_ref()
    }

    #[must_use]
    pub fn has(&self, tier: Tier) -> bool {
        self.variants[tier.slot()].is_some()
    }

    /// Drops the image at `tier`. Returns true if one was present.
    pub fn unload(&mut self, tier: Tier) -> bool {
        self.variants[tier.slot()].take().is_some()
    }

    pub fn unload_high_res(&mut self) -> bool {
        self.unload(Tier::High)
    }

    pub fn unload_zoomed(&mut self) -> bool {
        self.unload(Tier::Zoomed)
    }

    pub fn unload_all(&mut self) {
        for tier in Tier::ALL {
            self.unload(tier);
        }
    }

    /// The best loaded variant: high, then zoomed, then low.
    #[must_use]
    pub fn displayable(&self) -> Option<&PageVariant> {
        [Tier::High, Tier::Zoomed, Tier::Low]
            .into_iter()
            .find_map(|tier| self.variant(tier))
    }

    #[must_use]
    pub fn displayable_image(&self) -> Option<Arc<PageImage>> {
        self.displayable().map(|v| Arc::clone(&v.image))
    }

    /// Number of tiers currently holding an image.
    #[must_use]
    pub fn loaded_tiers(&self) -> usize {
        self.variants.iter().filter(|v| v.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: u32, height: u32, dpi: u32, fill: u8) -> PageImage {
        let stride = FrameGeometry::aligned_stride(width, PixelFormat::Rgb8);
        let geometry = FrameGeometry::new(width, height, stride, PixelFormat::Rgb8);
        let pixels = NativeBuffer::from_slice(&vec![fill; geometry.byte_len()]).unwrap();
        PageImage::from_buffer(geometry, dpi, pixels).unwrap()
    }

    #[test]
    fn displayable_prefers_high_then_zoomed_then_low() {
        let mut page = Page::new(1, image(2, 2, 20, 1));
        assert_eq!(page.displayable().unwrap().tier, Tier::Low);

        page.set_zoomed(image(4, 4, 144, 3), 2.0);
        assert_eq!(page.displayable().unwrap().tier, Tier::Zoomed);

        page.set_high_res(image(3, 3, 72, 2));
        assert_eq!(page.displayable().unwrap().tier, Tier::High);
        assert_eq!(page.displayable_image().unwrap().dpi(), 72);

        page.unload_high_res();
        assert_eq!(page.displayable().unwrap().tier, Tier::Zoomed);
        assert!((page.displayable().unwrap().zoom - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn setting_a_tier_replaces_previous_image() {
        let mut page = Page::new(1, image(2, 2, 20, 0));
        page.set_high_res(image(2, 2, 72, 1));
        let first = page.displayable_image().unwrap();
        page.set_high_res(image(2, 2, 72, 9));

        assert_eq!(page.loaded_tiers(), 2);
        assert_eq!(page.displayable_image().unwrap().pixel(0, 0).unwrap(), [9, 9, 9]);
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn unload_is_idempotent() {
        let mut page = Page::new(2, image(2, 2, 20, 0));
        page.set_high_res(image(2, 2, 72, 1));
        assert!(page.unload_high_res());
        assert!(!page.unload_high_res());
        assert!(!page.has(Tier::High));
    }

    #[test]
    fn unload_all_leaves_nothing_displayable() {
        let mut page = Page::new(1, image(2, 2, 20, 0));
        page.set_zoomed(image(2, 2, 144, 1), 2.0);
        page.unload_all();
        assert!(page.displayable().is_none());
        assert_eq!(page.loaded_tiers(), 0);
    }

    #[test]
    fn copy_from_frame_detaches_from_engine_memory() {
        let geometry = FrameGeometry::new(2, 1, 8, PixelFormat::Rgb8);
        let mut engine_memory = vec![1, 2, 3, 4, 5, 6, 0, 0];
        let frame =
            unsafe { NativeBuffer::from_engine(engine_memory.as_mut_ptr(), engine_memory.len()) };

        let copied = PageImage::copy_from_frame(&geometry, &frame, 72).unwrap();
        drop(frame);
        engine_memory.fill(0xFF);

        assert_eq!(copied.pixel(1, 0).unwrap(), [4, 5, 6]);
        assert!(!copied.pixels().is_engine_owned());
    }

    #[test]
    fn copy_from_short_frame_fails() {
        let geometry = FrameGeometry::new(2, 2, 8, PixelFormat::Rgb8);
        let frame = NativeBuffer::with_len(8).unwrap();
        assert!(PageImage::copy_from_frame(&geometry, &frame, 72).is_err());
    }

    #[test]
    fn rgb_image_drops_row_padding() {
        let geometry = FrameGeometry::new(1, 2, 4, PixelFormat::Rgb8);
        let pixels = NativeBuffer::from_slice(&[10, 20, 30, 0, 40, 50, 60, 0]).unwrap();
        let image = PageImage::from_buffer(geometry, 72, pixels).unwrap();

        let rgb = image.to_rgb_image().unwrap();
        assert_eq!(rgb.dimensions(), (1, 2));
        assert_eq!(rgb.get_pixel(0, 1).0, [40, 50, 60]);
        assert_eq!(image.row(1).unwrap(), &[40, 50, 60]);
        assert!(image.row(2).is_err());
        assert!(image.pixel(1, 0).is_err());
    }
}
