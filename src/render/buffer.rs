//! Owned, bounds-checked access to raw pixel memory
//!
//! A [`NativeBuffer`] either owns a zero-initialised heap region it allocated
//! itself, or wraps a region that belongs to the render engine. Engine memory
//! is only valid for the duration of a single display callback, so wrapped
//! buffers are never freed by us: the consumer copies the bytes it needs out
//! before the callback returns.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use super::error::BufferError;

/// Live owned buffers above which the leak audit starts complaining.
const LIVE_BUFFER_WARN_THRESHOLD: usize = 4096;

static OWNED_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static OWNED_RELEASED: AtomicUsize = AtomicUsize::new(0);

fn audit_live_buffers() {
    let live = live_owned_buffers();
    if live > LIVE_BUFFER_WARN_THRESHOLD {
        warn!(
            "NativeBuffer leak audit: live={live} allocated={} released={}",
            OWNED_ALLOCATED.load(Ordering::Relaxed),
            OWNED_RELEASED.load(Ordering::Relaxed)
        );
    }
}

/// Number of self-allocated buffers that have not been released yet.
#[must_use]
pub fn live_owned_buffers() -> usize {
    OWNED_ALLOCATED
        .load(Ordering::Relaxed)
        .saturating_sub(OWNED_RELEASED.load(Ordering::Relaxed))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backing {
    /// Allocated by us, freed on release
    Owned,
    /// Lent by the render engine for one callback
    Engine,
}

/// Plain-old-data element types that can be read from or written to a buffer.
pub trait Element: Copy + sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Element for $t {}
        )*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Contiguous memory region of fixed length with explicit release.
pub struct NativeBuffer {
    ptr: Option<NonNull<u8>>,
    len: usize,
    backing: Backing,
}

// SAFETY: the buffer has exclusive ownership of its region (or, for engine
// memory, exclusive use of it for the callback it was lent for). Shared
// references only permit reads.
unsafe impl Send for NativeBuffer {}
unsafe impl Sync for NativeBuffer {}

impl NativeBuffer {
    /// An empty buffer holding no region.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ptr: None,
            len: 0,
            backing: Backing::Owned,
        }
    }

    /// Allocates a new zero-filled buffer of `len` bytes.
    pub fn with_len(len: usize) -> Result<Self, BufferError> {
        let mut buffer = Self::empty();
        buffer.allocate(len)?;
        Ok(buffer)
    }

    /// Allocates a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BufferError> {
        let mut buffer = Self::with_len(bytes.len())?;
        buffer.as_mut_slice()?.copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Wraps memory owned by the render engine without copying it.
    ///
    /// A null `ptr` yields an empty buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `len` bytes that stay valid and are not
    /// accessed through any other path for as long as the returned buffer is
    /// used. The buffer never frees this memory.
    #[must_use]
    pub unsafe fn from_engine(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: NonNull::new(ptr),
            len,
            backing: Backing::Engine,
        }
    }

    /// Allocates a zero-filled region of `len` bytes into an empty buffer.
    pub fn allocate(&mut self, len: usize) -> Result<(), BufferError> {
        if self.ptr.is_some() {
            return Err(BufferError::AlreadyAllocated { len: self.len });
        }

        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            let layout =
                Layout::array::<u8>(len).map_err(|_| BufferError::AllocationFailed { len })?;
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc::alloc_zeroed(layout) };
            NonNull::new(raw).ok_or(BufferError::AllocationFailed { len })?
        };

        self.ptr = Some(ptr);
        self.len = len;
        self.backing = Backing::Owned;
        OWNED_ALLOCATED.fetch_add(1, Ordering::Relaxed);
        audit_live_buffers();
        Ok(())
    }

    /// Length in bytes fixed at allocation; zero once released.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the buffer holds no region (never allocated or released).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// True if the region was lent by the render engine.
    #[must_use]
    pub fn is_engine_owned(&self) -> bool {
        self.backing == Backing::Engine && self.ptr.is_some()
    }

    fn live_ptr(&self) -> Result<NonNull<u8>, BufferError> {
        self.ptr.ok_or(BufferError::UseAfterFree)
    }

    fn check_span(&self, offset: usize, width: usize) -> Result<NonNull<u8>, BufferError> {
        let ptr = self.live_ptr()?;
        match offset.checked_add(width) {
            Some(end) if end <= self.len => Ok(ptr),
            _ => Err(BufferError::OutOfBounds {
                index: offset,
                len: self.len,
            }),
        }
    }

    /// Reads the byte at `index`.
    pub fn read(&self, index: usize) -> Result<u8, BufferError> {
        self.read_at::<u8>(index)
    }

    /// Writes `value` at `index`.
    pub fn write(&mut self, index: usize, value: u8) -> Result<(), BufferError> {
        self.write_at::<u8>(index, value)
    }

    /// Reads the `index`-th element of type `T` (native endianness).
    pub fn read_at<T: Element>(&self, index: usize) -> Result<T, BufferError> {
        let width = size_of::<T>();
        let offset = index
            .checked_mul(width)
            .ok_or(BufferError::OutOfBounds {
                index,
                len: self.len,
            })?;
        let ptr = self.check_span(offset, width).map_err(|e| match e {
            BufferError::OutOfBounds { len, .. } => BufferError::OutOfBounds { index, len },
            other => other,
        })?;
        // SAFETY: span checked against the region length above.
        Ok(unsafe { ptr::read_unaligned(ptr.as_ptr().add(offset).cast::<T>()) })
    }

    /// Writes the `index`-th element of type `T` (native endianness).
    pub fn write_at<T: Element>(&mut self, index: usize, value: T) -> Result<(), BufferError> {
        let width = size_of::<T>();
        let offset = index
            .checked_mul(width)
            .ok_or(BufferError::OutOfBounds {
                index,
                len: self.len,
            })?;
        let ptr = self.check_span(offset, width).map_err(|e| match e {
            BufferError::OutOfBounds { len, .. } => BufferError::OutOfBounds { index, len },
            other => other,
        })?;
        // SAFETY: span checked against the region length above.
        unsafe { ptr::write_unaligned(ptr.as_ptr().add(offset).cast::<T>(), value) };
        Ok(())
    }

    /// Borrows all bytes without copying.
    pub fn as_slice(&self) -> Result<&[u8], BufferError> {
        let ptr = self.live_ptr()?;
        // SAFETY: ptr is valid for len bytes while the buffer holds it, and
        // release needs `&mut self` so the borrow cannot outlive it.
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) })
    }

    /// Mutably borrows all bytes without copying.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], BufferError> {
        let ptr = self.live_ptr()?;
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) })
    }

    /// Copies the bytes into a freshly allocated owned buffer.
    pub fn to_owned_buffer(&self) -> Result<NativeBuffer, BufferError> {
        NativeBuffer::from_slice(self.as_slice()?)
    }

    /// Releases the region. Idempotent; engine memory is only forgotten.
    pub fn release(&mut self) {
        let Some(ptr) = self.ptr.take() else {
            return;
        };

        if self.backing == Backing::Owned {
            if self.len > 0 {
                if let Ok(layout) = Layout::array::<u8>(self.len) {
                    // SAFETY: allocated in `allocate` with this exact layout.
                    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                }
            }
            OWNED_RELEASED.fetch_add(1, Ordering::Relaxed);
        }
        self.len = 0;
    }
}

impl Default for NativeBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("len", &self.len)
            .field("empty", &self.is_empty())
            .field("backing", &self.backing)
            .finish()
    }
}
