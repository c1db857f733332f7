// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Committing packed atlas cells to the GPU.
//!
//! Packing decides where each cell goes; the tasks here only execute that placement. Both
//! variants wait for the per-cell preparation tasks first, which blocks the calling thread.
//! That is only sound because they always run on the device thread, which is never one of
//! the executor's workers.

use std::sync::Arc;

use crate::buffer::{ImageInfo, PixelBuffer, PixelData};
use crate::gpu::{GpuDevice, TextureProxy, UniqueKey};
use crate::task::{TaskDependency, TaskStatus};
use crate::{Error, Result};

/// The pixels of one packed rectangle and where they go in the atlas.
#[derive(Debug, Clone)]
pub struct AtlasCellData {
    /// The payload, or `None` if it was evicted before the upload. Such cells are skipped.
    pub pixels: Option<Arc<PixelData>>,
    /// Dimensions and row stride of `pixels`.
    pub info: ImageInfo,
    /// Top left corner of the cell inside the atlas texture.
    pub atlas_offset: [u32; 2],
}

impl AtlasCellData {
    /// A cell whose `pixels` go to `atlas_offset`.
    pub fn new(pixels: Option<Arc<PixelData>>, info: ImageInfo, atlas_offset: [u32; 2]) -> Self {
        Self {
            pixels,
            info,
            atlas_offset,
        }
    }
}

/// Lifecycle of a [`ResourceTask`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UploadState {
    /// Not executed yet.
    Created,
    /// Blocked on the preparation tasks.
    WaitingOnDependencies,
    /// Writing to the device.
    Committing,
    /// Done. Individual cells or buffers may still have been skipped.
    Succeeded,
    /// The task could not run at all.
    Failed,
}

/// What an upload did, for diagnostics.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct UploadReport {
    /// Textures instantiated from pixel buffers.
    pub textures_created: usize,
    /// Proxies which already resolved to a texture.
    pub textures_reused: usize,
    /// Buffers the device couldn't turn into a texture.
    pub buffers_failed: usize,
    /// Cells written into an atlas.
    pub cells_written: usize,
    /// Cells without a payload, without a destination, or rejected by the device.
    pub cells_skipped: usize,
}

/// A task producing GPU resources, executed once on the device thread.
pub trait ResourceTask {
    /// Content-addressed key of the resource this task produces.
    fn unique_key(&self) -> UniqueKey;

    /// Where the task is in its lifecycle.
    fn state(&self) -> UploadState;

    /// Waits for the dependencies, then commits to `device`.
    ///
    /// Not restartable: any call after the first returns [`Error::AlreadyExecuted`].
    ///
    /// # Errors
    ///
    /// See the implementations for the variant specific failure policy.
    fn execute(&mut self, device: &mut dyn GpuDevice) -> Result<()>;
}

/// Instantiates whole textures from pixel buffers which preparation tasks filled in.
///
/// A proxy which already resolves to a texture is skipped, so committing the same proxy twice
/// is not an error. A buffer which can't be turned into a texture is skipped too; the atlas is
/// then incomplete but the task still succeeds.
#[derive(Debug)]
pub struct HardwareAtlasUploadTask {
    key: UniqueKey,
    cell_tasks: Vec<Arc<dyn TaskDependency>>,
    buffers: Vec<(Arc<PixelBuffer>, TextureProxy)>,
    state: UploadState,
    report: UploadReport,
}

impl HardwareAtlasUploadTask {
    /// An upload turning each buffer into the texture of its proxy once `cell_tasks` are done.
    pub fn new(
        key: UniqueKey,
        cell_tasks: Vec<Arc<dyn TaskDependency>>,
        buffers: Vec<(Arc<PixelBuffer>, TextureProxy)>,
    ) -> Self {
        Self {
            key,
            cell_tasks,
            buffers,
            state: UploadState::Created,
            report: UploadReport::default(),
        }
    }

    /// Forgets preparation tasks which were canceled, before the task is executed.
    ///
    /// Returns the number of dependencies removed.
    pub fn drop_canceled_dependencies(&mut self) -> usize {
        drop_canceled(&mut self.cell_tasks, self.state)
    }

    /// What the last [`execute`](ResourceTask::execute) did.
    pub fn last_report(&self) -> UploadReport {
        self.report
    }
}

impl ResourceTask for HardwareAtlasUploadTask {
    fn unique_key(&self) -> UniqueKey {
        self.key
    }

    fn state(&self) -> UploadState {
        self.state
    }

    fn execute(&mut self, device: &mut dyn GpuDevice) -> Result<()> {
        if self.state != UploadState::Created {
            return Err(Error::AlreadyExecuted(self.key));
        }
        self.state = UploadState::WaitingOnDependencies;
        for task in std::mem::take(&mut self.cell_tasks) {
            task.wait();
        }

        self.state = UploadState::Committing;
        for (buffer, proxy) in std::mem::take(&mut self.buffers) {
            buffer.unlock_pixels();
            if proxy.texture(&*device).is_some() {
                self.report.textures_reused += 1;
                continue;
            }
            let Some(texture) = device.create_texture_from_buffer(&buffer) else {
                log::warn!(
                    "Skipping atlas buffer {:?} of upload {:?}: no texture could be created",
                    proxy.unique_key(),
                    self.key
                );
                self.report.buffers_failed += 1;
                continue;
            };
            device.assign_unique_key(&texture, proxy.unique_key());
            self.report.textures_created += 1;
        }

        self.state = UploadState::Succeeded;
        log::debug!("Hardware atlas upload {:?}: {:?}", self.key, self.report);
        Ok(())
    }
}

/// Writes cells into atlas textures which already exist.
///
/// Unlike the hardware variant, executing without any preparation tasks fails: an empty
/// dependency set means the atlas build was never given data.
#[derive(Debug)]
pub struct SoftwareAtlasUploadTask {
    key: UniqueKey,
    cell_tasks: Vec<Arc<dyn TaskDependency>>,
    cell_data: Vec<(TextureProxy, Vec<AtlasCellData>)>,
    state: UploadState,
    report: UploadReport,
}

impl SoftwareAtlasUploadTask {
    /// An upload writing the cells of each atlas proxy once `cell_tasks` are done.
    pub fn new(
        key: UniqueKey,
        cell_tasks: Vec<Arc<dyn TaskDependency>>,
        cell_data: Vec<(TextureProxy, Vec<AtlasCellData>)>,
    ) -> Self {
        Self {
            key,
            cell_tasks,
            cell_data,
            state: UploadState::Created,
            report: UploadReport::default(),
        }
    }

    /// Forgets preparation tasks which were canceled, before the task is executed.
    ///
    /// Returns the number of dependencies removed.
    pub fn drop_canceled_dependencies(&mut self) -> usize {
        drop_canceled(&mut self.cell_tasks, self.state)
    }

    /// What the last [`execute`](ResourceTask::execute) did.
    pub fn last_report(&self) -> UploadReport {
        self.report
    }
}

impl ResourceTask for SoftwareAtlasUploadTask {
    fn unique_key(&self) -> UniqueKey {
        self.key
    }

    fn state(&self) -> UploadState {
        self.state
    }

    fn execute(&mut self, device: &mut dyn GpuDevice) -> Result<()> {
        if self.state != UploadState::Created {
            return Err(Error::AlreadyExecuted(self.key));
        }
        if self.cell_tasks.is_empty() {
            self.state = UploadState::Failed;
            return Err(Error::NoDependencies(self.key));
        }
        self.state = UploadState::WaitingOnDependencies;
        for task in std::mem::take(&mut self.cell_tasks) {
            task.wait();
        }

        self.state = UploadState::Committing;
        for (proxy, cells) in std::mem::take(&mut self.cell_data) {
            if cells.is_empty() {
                continue;
            }
            let Some(texture) = proxy.texture(&*device) else {
                log::debug!(
                    "Atlas {:?} is not instantiated, skipping {} cells",
                    proxy.unique_key(),
                    cells.len()
                );
                self.report.cells_skipped += cells.len();
                continue;
            };
            for cell in cells {
                let Some(pixels) = cell.pixels.as_ref() else {
                    self.report.cells_skipped += 1;
                    continue;
                };
                let pixels = pixels.read();
                match device.write_pixels(&texture, cell.atlas_offset, &cell.info, &pixels) {
                    Ok(()) => self.report.cells_written += 1,
                    Err(err) => {
                        log::warn!("Skipping atlas cell at {:?}: {err}", cell.atlas_offset);
                        self.report.cells_skipped += 1;
                    }
                }
            }
        }

        self.state = UploadState::Succeeded;
        log::debug!("Software atlas upload {:?}: {:?}", self.key, self.report);
        Ok(())
    }
}

fn drop_canceled(tasks: &mut Vec<Arc<dyn TaskDependency>>, state: UploadState) -> usize {
    if state != UploadState::Created {
        return 0;
    }
    let before = tasks.len();
    tasks.retain(|task| task.status() != TaskStatus::Canceled);
    before - tasks.len()
}
