// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Asynchronous resource preparation for retained-mode 2D scenes.
//!
//! Scene nodes frequently reference content that is too expensive to produce on the render
//! thread: encoded images which need decoding, and vector shapes whose outlines need extracting.
//! This crate moves that work onto background workers while keeping the thread which owns the
//! GPU device non-blocking, and commits packed raster fragments into shared atlas textures once
//! their preparation finishes.
//!
//! The pieces, leaf first:
//!
//! - [`Task`] is the unit of asynchronous work. It is dispatched through an [`Executor`] with a
//!   [`TaskPriority`], can be waited on, and can be canceled on a best-effort basis.
//! - [`DeferredGraphic`] is one loadable source, either an [`ImageGraphic`] or a [`ShapeGraphic`],
//!   identified by the [`SourceId`] of the generator or shape it wraps.
//! - [`GraphicsLoader`] tracks which nodes wait on which sources, bounds how many loads start per
//!   frame, caches finished results and tells nodes when everything they asked for is available.
//! - [`HardwareAtlasUploadTask`] and [`SoftwareAtlasUploadTask`] wait on the per-cell preparation
//!   tasks of an atlas and then commit the pixels through a [`GpuDevice`].
//!
//! ## Frame integration
//!
//! ```ignore
//! let executor = Arc::new(ThreadPoolExecutor::new(ExecutorOptions::default())?);
//! let mut loader = GraphicsLoader::new(executor, LoaderOptions::default());
//!
//! // While building content for a node:
//! loader.add_async_content(&node, Some(&content), Some(&device));
//!
//! // Once per frame, around device use:
//! loader.on_attach();
//! // ... record and submit the frame ...
//! loader.on_detach();
//! ```
//!
//! All bookkeeping happens on the device thread. Worker threads only ever touch the
//! task-local fields of the work they run.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![expect(
    clippy::exhaustive_enums,
    clippy::missing_panics_doc,
    reason = "Deferred"
)]

mod atlas;
mod buffer;
mod executor;
mod loader;
mod source;
mod task;

pub mod gpu;

/// 2D geometry, with a focus on curves.
pub use peniko::kurbo;

pub use atlas::{
    AtlasCellData, HardwareAtlasUploadTask, ResourceTask, SoftwareAtlasUploadTask, UploadReport,
    UploadState,
};
pub use buffer::{ImageFormat, ImageInfo, PixelBuffer, PixelData};
pub use executor::{Executor, ExecutorOptions, InlineExecutor, Job, ThreadPoolExecutor};
pub use gpu::{CpuDevice, GpuDevice, ResourceCache, ResourceId, Texture, TextureProxy, UniqueKey};
pub use loader::{
    AsyncNode, ContentCollector, GraphicsLoader, LayerContent, LoaderOptions, LoaderStats, NodeId,
};
pub use source::{
    DeferredGraphic, GraphicLoadTask, ImageGenerator, ImageGraphic, Shape, ShapeGraphic, SourceId,
};
pub use task::{CancelOutcome, Task, TaskDependency, TaskPriority, TaskStatus};

#[cfg(feature = "wgpu")]
pub use gpu::WgpuDevice;

use thiserror::Error;

/// Errors that can occur while preparing or committing resources.
///
/// Cache misses and rejected registrations are not errors; they are reported through
/// `Option` and `bool` return values.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A software atlas upload was executed without any preparation tasks,
    /// which means the atlas build was never supplied with data.
    #[error("Atlas upload '{0:?}' has no preparation tasks to commit")]
    NoDependencies(UniqueKey),
    /// `execute` was called on an upload task which has already run.
    #[error("Atlas upload '{0:?}' has already been executed")]
    AlreadyExecuted(UniqueKey),
    /// The row stride is smaller than one row of tightly packed pixels.
    #[error("Row stride of {row_bytes} bytes is too small for {width} pixels of {format:?}")]
    InvalidRowBytes {
        /// Requested stride.
        row_bytes: usize,
        /// Width of a row, in pixels.
        width: u32,
        /// Pixel format of the row.
        format: ImageFormat,
    },
    /// The pixel payload holds fewer bytes than its descriptor requires.
    #[error("Pixel data holds {actual} bytes, but {expected} are required")]
    PixelDataTooSmall {
        /// Bytes required by the image descriptor.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },
    /// A write targeted a rectangle which doesn't lie inside the destination texture.
    #[error("Rectangle at {offset:?} of size {width}x{height} is outside the {texture_width}x{texture_height} texture")]
    OutOfBounds {
        /// Top left corner of the write.
        offset: [u32; 2],
        /// Width of the write.
        width: u32,
        /// Height of the write.
        height: u32,
        /// Width of the destination.
        texture_width: u32,
        /// Height of the destination.
        texture_height: u32,
    },
    /// The device no longer knows about the texture, e.g. because it was freed.
    #[error("Texture {0:?} is not available on this device")]
    UnknownTexture(ResourceId),
    /// The destination texture uses a different pixel format than the source data.
    #[error("Cannot write {source_format:?} pixels into a {texture_format:?} texture")]
    FormatMismatch {
        /// Format of the pixel data.
        source_format: ImageFormat,
        /// Format of the destination texture.
        texture_format: ImageFormat,
    },
}

/// Shorthand for results of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
