// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::{
    Device, Extent3d, Origin3d, Queue, TexelCopyBufferLayout, TexelCopyTextureInfo, TextureAspect,
    TextureDescriptor, TextureDimension, TextureUsages, TextureView, TextureViewDescriptor,
};

use super::{check_write, GpuDevice, ResourceCache, ResourceId, Texture, UniqueKey};
use crate::buffer::{ImageFormat, ImageInfo, PixelBuffer};
use crate::{Error, Result};

/// Commits pixels to a [`wgpu::Device`].
pub struct WgpuDevice {
    device: Device,
    queue: Queue,
    textures: HashMap<ResourceId, (wgpu::Texture, TextureView)>,
    resources: ResourceCache,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("textures", &self.textures.len())
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl WgpuDevice {
    /// Uploads through `queue` into textures created on `device`.
    pub fn new(device: Device, queue: Queue) -> Self {
        Self {
            device,
            queue,
            textures: HashMap::new(),
            resources: ResourceCache::new(),
        }
    }

    /// The view used to bind `texture` in a render pass.
    pub fn texture_view(&self, texture: &Texture) -> Option<&TextureView> {
        self.textures.get(&texture.id()).map(|(_, view)| view)
    }

    /// Releases the storage of `texture`.
    pub fn free_texture(&mut self, texture: &Texture) {
        if let Some((texture, _view)) = self.textures.remove(&texture.id()) {
            texture.destroy();
        }
    }

    /// The content-addressed lookup table of this device.
    pub fn resources(&mut self) -> &mut ResourceCache {
        &mut self.resources
    }

    fn allocate(&mut self, width: u32, height: u32, format: ImageFormat) -> Arc<Texture> {
        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("vello_prep.atlas"),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            format: format.to_wgpu(),
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());
        let handle = Arc::new(Texture::new(width, height, format));
        self.textures.insert(handle.id(), (texture, view));
        handle
    }
}

impl GpuDevice for WgpuDevice {
    fn create_texture_from_buffer(&mut self, buffer: &PixelBuffer) -> Option<Arc<Texture>> {
        let info = *buffer.info();
        if info.is_empty() {
            return None;
        }
        let limit = self.device.limits().max_texture_dimension_2d;
        if info.width() > limit || info.height() > limit {
            log::warn!(
                "Image of {}x{} exceeds the maximum texture size of {limit}",
                info.width(),
                info.height()
            );
            return None;
        }
        let texture = self.allocate(info.width(), info.height(), info.format());
        let pixels = buffer.pixels();
        if let Err(err) = self.write_pixels(&texture, [0, 0], &info, &pixels) {
            log::warn!("Failed to upload pixel buffer: {err}");
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
        let (target, _) = self
            .textures
            .get(&texture.id())
            .ok_or(Error::UnknownTexture(texture.id()))?;
        let bytes_per_row = u32::try_from(info.row_bytes()).map_err(|_| Error::InvalidRowBytes {
            row_bytes: info.row_bytes(),
            width: info.width(),
            format: info.format(),
        })?;
        self.queue.write_texture(
            TexelCopyTextureInfo {
                texture: target,
                mip_level: 0,
                origin: Origin3d {
                    x: offset[0],
                    y: offset[1],
                    z: 0,
                },
                aspect: TextureAspect::All,
            },
            pixels,
            TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: None,
            },
            Extent3d {
                width: info.width(),
                height: info.height(),
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn find_texture(&self, key: &UniqueKey) -> Option<Arc<Texture>> {
        let texture = self.resources.find(key)?;
        self.textures.contains_key(&texture.id()).then_some(texture)
    }

    fn assign_unique_key(&mut self, texture: &Arc<Texture>, key: UniqueKey) {
        self.resources.assign(texture, key);
    }
}
