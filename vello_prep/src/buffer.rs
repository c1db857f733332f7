// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CPU-side pixel storage.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Error, Result};

/// Pixel layout of an image or texture.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8 bits per channel, in RGBA order.
    Rgba8,
    /// 8 bits per channel, in BGRA order.
    Bgra8,
    /// A single 8 bit coverage channel, as used by glyph and mask atlases.
    Alpha8,
}

impl ImageFormat {
    /// Size of one pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Alpha8 => 1,
        }
    }

    #[cfg(feature = "wgpu")]
    pub(crate) fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            Self::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
            Self::Alpha8 => wgpu::TextureFormat::R8Unorm,
        }
    }
}

/// Describes the dimensions and memory layout of a block of pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ImageInfo {
    width: u32,
    height: u32,
    row_bytes: usize,
    format: ImageFormat,
}

impl ImageInfo {
    /// Tightly packed pixels, without any padding between rows.
    pub fn new(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            row_bytes: width as usize * format.bytes_per_pixel(),
            format,
        }
    }

    /// The same image with an explicit row stride.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRowBytes`] if `row_bytes` can't hold one row of pixels.
    pub fn with_row_bytes(self, row_bytes: usize) -> Result<Self> {
        if row_bytes < self.min_row_bytes() {
            return Err(Error::InvalidRowBytes {
                row_bytes,
                width: self.width,
                format: self.format,
            });
        }
        Ok(Self { row_bytes, ..self })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Distance between the starts of two consecutive rows, in bytes.
    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// Layout of a single pixel.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Bytes occupied by the pixels of one row, excluding padding.
    pub fn min_row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes required to hold every row at this stride.
    pub fn byte_size(&self) -> usize {
        self.row_bytes * self.height as usize
    }

    /// Whether there are no pixels at all.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A shared, mutable block of pixel bytes.
///
/// Preparation tasks write into it on worker threads; uploads read it on the device thread.
#[derive(Default)]
pub struct PixelData {
    bytes: RwLock<Vec<u8>>,
}

impl Debug for PixelData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelData")
            .field("len", &self.len())
            .finish()
    }
}

impl PixelData {
    /// Wraps `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Shared access. A writer which panicked doesn't poison the data.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded pixels, either in plain CPU memory or in a buffer which the GPU can share.
///
/// A hardware buffer has to be unlocked before a texture can be made from it.
pub struct PixelBuffer {
    info: ImageInfo,
    data: PixelData,
    hardware: bool,
    locked: AtomicBool,
}

impl Debug for PixelBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("info", &self.info)
            .field("hardware", &self.hardware)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl PixelBuffer {
    /// A zero-initialized buffer.
    pub fn new(info: ImageInfo, hardware: bool) -> Self {
        Self {
            data: PixelData::zeroed(info.byte_size()),
            info,
            hardware,
            locked: AtomicBool::new(false),
        }
    }

    /// A CPU buffer wrapping existing pixels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PixelDataTooSmall`] if `pixels` is shorter than `info` requires.
    pub fn from_pixels(info: ImageInfo, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() < info.byte_size() {
            return Err(Error::PixelDataTooSmall {
                expected: info.byte_size(),
                actual: pixels.len(),
            });
        }
        Ok(Self {
            info,
            data: PixelData::new(pixels),
            hardware: false,
            locked: AtomicBool::new(false),
        })
    }

    /// Dimensions and layout of the pixels.
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// Whether the storage can be shared with the GPU without a copy.
    pub fn is_hardware(&self) -> bool {
        self.hardware
    }

    /// Locks the pixels for CPU writes and returns them.
    ///
    /// The buffer stays locked after the guard is dropped, until [`unlock_pixels`](Self::unlock_pixels).
    pub fn lock_pixels(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.locked.store(true, Ordering::Release);
        self.data.write()
    }

    /// Releases the CPU-side lock taken by [`lock_pixels`](Self::lock_pixels).
    pub fn unlock_pixels(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Whether the pixels are locked for CPU writes.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Read access to the pixels.
    pub fn pixels(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }
}
