// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::sync::Arc;

use super::{check_write, GpuDevice, ResourceCache, ResourceId, Texture, UniqueKey};
use crate::buffer::{ImageFormat, ImageInfo, PixelBuffer};
use crate::{Error, Result};

struct CpuTexture {
    width: u32,
    format: ImageFormat,
    bytes: Vec<u8>,
}

impl CpuTexture {
    fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

/// A device whose textures live in host memory.
///
/// Used as the software fallback, and to observe uploads in tests.
#[derive(Default)]
pub struct CpuDevice {
    textures: HashMap<ResourceId, CpuTexture>,
    resources: ResourceCache,
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDevice")
            .field("textures", &self.textures.len())
            .field("resources", &self.resources)
            .finish()
    }
}

impl CpuDevice {
    /// A device without any textures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of textures currently allocated.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Tightly packed contents of `texture`.
    pub fn read_texture(&self, texture: &Texture) -> Option<&[u8]> {
        self.textures
            .get(&texture.id())
            .map(|texture| texture.bytes.as_slice())
    }

    /// Releases the storage of `texture`. Handles to it stay valid but resolve to nothing.
    pub fn free_texture(&mut self, texture: &Texture) {
        self.textures.remove(&texture.id());
    }

    /// The content-addressed lookup table of this device.
    pub fn resources(&mut self) -> &mut ResourceCache {
        &mut self.resources
    }

    fn allocate(&mut self, width: u32, height: u32, format: ImageFormat) -> Arc<Texture> {
        let texture = Arc::new(Texture::new(width, height, format));
        let len = width as usize * height as usize * format.bytes_per_pixel();
        self.textures.insert(
            texture.id(),
            CpuTexture {
                width,
                format,
                bytes: vec![0; len],
            },
        );
        texture
    }
}

impl GpuDevice for CpuDevice {
    fn create_texture_from_buffer(&mut self, buffer: &PixelBuffer) -> Option<Arc<Texture>> {
        let info = *buffer.info();
        if info.is_empty() {
            return None;
        }
        if buffer.is_hardware() && buffer.is_locked() {
            log::warn!("Refusing to create a texture from a hardware buffer which is still locked");
            return None;
        }
        let texture = self.allocate(info.width(), info.height(), info.format());
        let pixels = buffer.pixels();
        if let Err(err) = self.write_pixels(&texture, [0, 0], &info, &pixels) {
            log::warn!("Could not fill a texture from a pixel buffer: {err}");
            self.free_texture(&texture);
            return None;
        }
        Some(texture)
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Option<Arc<Texture>> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(self.allocate(width, height, format))
    }

    fn write_pixels(
        &mut self,
        texture: &Texture,
        offset: [u32; 2],
        info: &ImageInfo,
        pixels: &[u8],
    ) -> Result<()> {
        check_write(texture, offset, info, pixels)?;
        let target = self
            .textures
            .get_mut(&texture.id())
            .ok_or(Error::UnknownTexture(texture.id()))?;
        let bpp = target.format.bytes_per_pixel();
        let dst_stride = target.row_bytes();
        let len = info.min_row_bytes();
        for row in 0..info.height() as usize {
            let src = row * info.row_bytes();
            let dst = (offset[1] as usize + row) * dst_stride + offset[0] as usize * bpp;
            target.bytes[dst..dst + len].copy_from_slice(&pixels[src..src + len]);
        }
        Ok(())
    }

    fn find_texture(&self, key: &UniqueKey) -> Option<Arc<Texture>> {
        let texture = self.resources.find(key)?;
        // A freed texture must not be handed out again.
        self.textures.contains_key(&texture.id()).then_some(texture)
    }

    fn assign_unique_key(&mut self, texture: &Arc<Texture>, key: UniqueKey) {
        self.resources.assign(texture, key);
    }
}
