// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The GPU surface used to commit prepared pixels.
//!
//! Only the device-owning thread may create or mutate textures, so none of these types
//! lock around texture creation.

mod cpu;
#[cfg(feature = "wgpu")]
mod wgpu_device;

pub use cpu::CpuDevice;
#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{ImageFormat, ImageInfo, PixelBuffer};
use crate::{Error, Result};

/// Identifies a texture allocated by a [`GpuDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub NonZeroU64);

impl ResourceId {
    /// A process-wide unique id.
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// A key derived from content identity.
///
/// Independently created proxies carrying equal keys resolve to the same physical texture.
///
/// Keys are 64-bit digests. Two distinct contents whose digests happen to be equal resolve
/// to the same texture, so content-derived keys should only be used where that outcome is
/// tolerable (e.g. caches of glyphs or decoded pages). Use [`UniqueKey::next`] for
/// resources which must never alias another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueKey(u64);

impl UniqueKey {
    /// Derives a key from anything which identifies the content.
    ///
    /// Equal content always gives the same key within one process. The digest isn't stable
    /// across Rust releases, so keys must not be persisted.
    pub fn from_content(content: &impl Hash) -> Self {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// A key which isn't derived from any content, for resources that are never shared.
    ///
    /// Keys returned from here never repeat within one process.
    pub fn next() -> Self {
        static KEY_COUNTER: AtomicU64 = AtomicU64::new(1);
        let mut hasher = DefaultHasher::new();
        ("unique", KEY_COUNTER.fetch_add(1, Ordering::Relaxed)).hash(&mut hasher);
        Self(hasher.finish())
    }

    /// The raw key value.
    pub fn to_bits(self) -> u64 {
        self.0
    }
}

/// A texture living on a [`GpuDevice`].
///
/// This is only a handle; the storage is owned by the device and is shared by reference counting.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Texture {
    id: ResourceId,
    width: u32,
    height: u32,
    format: ImageFormat,
}

impl Texture {
    /// A handle to newly allocated device storage.
    ///
    /// Only device implementations should need to call this.
    pub fn new(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            id: ResourceId::next(),
            width,
            height,
            format,
        }
    }

    /// The device-wide identity of this texture.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout of the storage.
    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

/// Placeholder for a texture which may not have been instantiated yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureProxy {
    key: UniqueKey,
    width: u32,
    height: u32,
    format: ImageFormat,
}

impl TextureProxy {
    /// A proxy for a `width` by `height` texture which will be tagged with `key`.
    pub fn new(key: UniqueKey, width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            key,
            width,
            height,
            format,
        }
    }

    /// The key the instantiated texture is looked up by.
    pub fn unique_key(&self) -> UniqueKey {
        self.key
    }

    /// Width of the texture to instantiate.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the texture to instantiate.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout of the texture to instantiate.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// The texture this proxy resolves to on `device`, if it has been instantiated.
    pub fn texture(&self, device: &dyn GpuDevice) -> Option<Arc<Texture>> {
        device.find_texture(&self.key)
    }
}

/// The operations atlas uploads need from a GPU device.
pub trait GpuDevice {
    /// Creates a texture holding the pixels of `buffer`.
    ///
    /// Returns `None` if the device can't make a texture from this buffer.
    fn create_texture_from_buffer(&mut self, buffer: &PixelBuffer) -> Option<Arc<Texture>>;

    /// Creates an uninitialized texture, e.g. a destination atlas.
    fn create_texture(&mut self, width: u32, height: u32, format: ImageFormat)
        -> Option<Arc<Texture>>;

    /// Writes `pixels`, laid out as described by `info`, into `texture` at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the rectangle is outside the texture, the formats differ, or `pixels` is
    /// shorter than `info` requires.
    fn write_pixels(
        &mut self,
        texture: &Texture,
        offset: [u32; 2],
        info: &ImageInfo,
        pixels: &[u8],
    ) -> Result<()>;

    /// Looks up the texture tagged with `key`.
    fn find_texture(&self, key: &UniqueKey) -> Option<Arc<Texture>>;

    /// Tags `texture` with `key`, so later lookups by `key` resolve to it.
    fn assign_unique_key(&mut self, texture: &Arc<Texture>, key: UniqueKey);
}

/// Content-addressed lookup of textures, shared by the device implementations.
#[derive(Debug, Default)]
pub struct ResourceCache {
    by_key: HashMap<UniqueKey, Arc<Texture>>,
}

impl ResourceCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The texture tagged with `key`, if any.
    pub fn find(&self, key: &UniqueKey) -> Option<Arc<Texture>> {
        self.by_key.get(key).cloned()
    }

    /// Tags `texture` with `key`. A texture previously tagged with the same key loses the tag.
    pub fn assign(&mut self, texture: &Arc<Texture>, key: UniqueKey) {
        if let Some(previous) = self.by_key.insert(key, Arc::clone(texture)) {
            if previous.id() != texture.id() {
                log::debug!("Unique key {key:?} moved from {:?} to {:?}", previous.id(), texture.id());
            }
        }
    }

    /// Removes the tag `key`, returning the texture which carried it.
    pub fn remove(&mut self, key: &UniqueKey) -> Option<Arc<Texture>> {
        self.by_key.remove(key)
    }

    /// Drops every entry which nothing outside the cache refers to any more.
    ///
    /// Returns the number of entries removed.
    pub fn purge_unreferenced(&mut self) -> usize {
        let before = self.by_key.len();
        self.by_key
            .retain(|_, texture| Arc::strong_count(texture) > 1);
        before - self.by_key.len()
    }

    /// Number of tagged textures.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether no texture is tagged.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Validates a sub-rectangle write before it reaches a backend.
pub(crate) fn check_write(
    texture: &Texture,
    offset: [u32; 2],
    info: &ImageInfo,
    pixels: &[u8],
) -> Result<()> {
    if info.format() != texture.format() {
        return Err(Error::FormatMismatch {
            source_format: info.format(),
            texture_format: texture.format(),
        });
    }
    let fits_x = offset[0]
        .checked_add(info.width())
        .is_some_and(|right| right <= texture.width());
    let fits_y = offset[1]
        .checked_add(info.height())
        .is_some_and(|bottom| bottom <= texture.height());
    if !fits_x || !fits_y {
        return Err(Error::OutOfBounds {
            offset,
            width: info.width(),
            height: info.height(),
            texture_width: texture.width(),
            texture_height: texture.height(),
        });
    }
    // The last row doesn't need to be padded out to the full stride.
    let expected = match info.height() {
        0 => 0,
        rows => (rows as usize - 1) * info.row_bytes() + info.min_row_bytes(),
    };
    if pixels.len() < expected {
        return Err(Error::PixelDataTooSmall {
            expected,
            actual: pixels.len(),
        });
    }
    Ok(())
}
