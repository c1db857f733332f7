// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deferred graphic sources and the task which loads them.

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use peniko::kurbo::BezPath;

use crate::buffer::PixelBuffer;
use crate::executor::Executor;
use crate::task::{CancelOutcome, Task, TaskPriority, TaskStatus};

/// Stable identity of an image generator or vector shape.
///
/// This is the only key used to deduplicate and cache loads: any number of requests for
/// the same `SourceId` resolve to a single load.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(NonZeroU64);

impl SourceId {
    /// A process-unique id. Never reused.
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// Produces decoded pixels, e.g. from an encoded PNG.
pub trait ImageGenerator: Send + Sync {
    /// Identity of this generator, fixed for its whole lifetime.
    fn source_id(&self) -> SourceId;

    /// Decodes the image.
    ///
    /// When `try_hardware` is set, a GPU-shareable buffer should be attempted first. If that isn't
    /// possible, a CPU buffer should be returned instead. `None` means decoding failed.
    fn make_buffer(&self, try_hardware: bool) -> Option<Arc<PixelBuffer>>;
}

/// A vector shape whose outline is computed on demand.
pub trait Shape: Send + Sync {
    /// Identity of this shape, fixed for its whole lifetime.
    fn source_id(&self) -> SourceId;

    /// The current outline, without any transform or style applied.
    fn path(&self) -> BezPath;
}

/// One unit of content whose loading can be deferred to a worker.
///
/// `load` runs on a worker thread and must not touch device or render thread state. The
/// accessors only return meaningful results once the load has completed, so callers have to
/// gate on the completion of the task which ran it.
pub trait DeferredGraphic: Send {
    /// Performs the decode or extraction.
    fn load(&mut self);

    /// Identity of the generator or shape being loaded.
    fn source(&self) -> SourceId;

    /// The decoded image, for image sources.
    fn buffer(&self) -> Option<Arc<PixelBuffer>> {
        None
    }

    /// The extracted outline, for shape sources.
    fn path(&self) -> Option<BezPath> {
        None
    }
}

/// Decodes an [`ImageGenerator`].
pub struct ImageGraphic {
    generator: Arc<dyn ImageGenerator>,
    try_hardware: bool,
    buffer: Option<Arc<PixelBuffer>>,
}

impl ImageGraphic {
    /// Decoding prefers a hardware buffer if `try_hardware` is set.
    pub fn new(generator: Arc<dyn ImageGenerator>, try_hardware: bool) -> Self {
        Self {
            generator,
            try_hardware,
            buffer: None,
        }
    }
}

impl Debug for ImageGraphic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGraphic")
            .field("source", &self.generator.source_id())
            .field("try_hardware", &self.try_hardware)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl DeferredGraphic for ImageGraphic {
    fn load(&mut self) {
        self.buffer = self.generator.make_buffer(self.try_hardware);
    }

    fn source(&self) -> SourceId {
        self.generator.source_id()
    }

    fn buffer(&self) -> Option<Arc<PixelBuffer>> {
        self.buffer.clone()
    }
}

/// Extracts the outline of a [`Shape`].
pub struct ShapeGraphic {
    shape: Arc<dyn Shape>,
    path: Option<BezPath>,
}

impl ShapeGraphic {
    /// An unloaded graphic for `shape`.
    pub fn new(shape: Arc<dyn Shape>) -> Self {
        Self { shape, path: None }
    }
}

impl Debug for ShapeGraphic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeGraphic")
            .field("source", &self.shape.source_id())
            .field("path", &self.path)
            .finish()
    }
}

impl DeferredGraphic for ShapeGraphic {
    fn load(&mut self) {
        self.path = Some(self.shape.path());
    }

    fn source(&self) -> SourceId {
        self.shape.source_id()
    }

    fn path(&self) -> Option<BezPath> {
        self.path.clone()
    }
}

/// Runs [`DeferredGraphic::load`] as a [`Task`] and keeps the loaded graphic.
#[derive(Debug, Clone)]
pub struct GraphicLoadTask {
    source: SourceId,
    task: Task<Box<dyn DeferredGraphic>>,
}

impl GraphicLoadTask {
    /// Dispatches the load of `graphic` on `executor`.
    pub fn spawn(
        executor: &dyn Executor,
        priority: TaskPriority,
        mut graphic: Box<dyn DeferredGraphic>,
    ) -> Self {
        let source = graphic.source();
        let task = Task::spawn(executor, priority, move || {
            log::trace!("Loading deferred graphic {source:?}");
            graphic.load();
            graphic
        });
        Self { source, task }
    }

    /// The source being loaded.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// See [`Task::status`].
    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    /// Blocks until the load reaches a terminal status.
    pub fn wait(&self) {
        self.task.wait();
    }

    /// See [`Task::cancel`].
    pub fn cancel(&self) -> CancelOutcome {
        self.task.cancel()
    }

    /// Takes the loaded graphic out of a finished task.
    pub fn take_graphic(&self) -> Option<Box<dyn DeferredGraphic>> {
        self.task.take_output()
    }
}

impl Debug for dyn DeferredGraphic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredGraphic")
            .field("source", &self.source())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use peniko::kurbo::{BezPath, Rect, Shape as _};

    use super::{
        DeferredGraphic, GraphicLoadTask, ImageGenerator, ImageGraphic, Shape, ShapeGraphic,
        SourceId,
    };
    use crate::buffer::{ImageFormat, ImageInfo, PixelBuffer};
    use crate::executor::InlineExecutor;
    use crate::task::{TaskPriority, TaskStatus};

    /// Counts decodes; only produces hardware buffers when allowed to.
    pub(crate) struct CountingImage {
        pub(crate) id: SourceId,
        pub(crate) hardware_supported: bool,
        pub(crate) decodes: AtomicUsize,
    }

    impl CountingImage {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: SourceId::next(),
                hardware_supported: false,
                decodes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn decodes(&self) -> usize {
            self.decodes.load(Ordering::SeqCst)
        }
    }

    impl ImageGenerator for CountingImage {
        fn source_id(&self) -> SourceId {
            self.id
        }

        fn make_buffer(&self, try_hardware: bool) -> Option<Arc<PixelBuffer>> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            let info = ImageInfo::new(2, 2, ImageFormat::Rgba8);
            Some(Arc::new(PixelBuffer::new(
                info,
                try_hardware && self.hardware_supported,
            )))
        }
    }

    pub(crate) struct RectShape {
        pub(crate) id: SourceId,
        pub(crate) rect: Rect,
    }

    impl RectShape {
        pub(crate) fn new(rect: Rect) -> Arc<Self> {
            Arc::new(Self {
                id: SourceId::next(),
                rect,
            })
        }
    }

    impl Shape for RectShape {
        fn source_id(&self) -> SourceId {
            self.id
        }

        fn path(&self) -> BezPath {
            self.rect.to_path(0.1)
        }
    }

    #[test]
    fn source_ids_are_unique() {
        let a = SourceId::next();
        let b = SourceId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn image_graphic_falls_back_to_cpu() {
        let generator = CountingImage::new();
        let mut graphic = ImageGraphic::new(generator.clone(), true);
        assert!(graphic.buffer().is_none());
        graphic.load();
        let buffer = graphic.buffer().unwrap();
        assert!(!buffer.is_hardware());
        assert_eq!(graphic.source(), generator.id);
        assert!(graphic.path().is_none());
    }

    #[test]
    fn shape_graphic_extracts_path() {
        let shape = RectShape::new(Rect::new(0.0, 0.0, 10.0, 5.0));
        let mut graphic = ShapeGraphic::new(shape.clone());
        graphic.load();
        assert_eq!(graphic.path(), Some(shape.path()));
        assert!(graphic.buffer().is_none());
    }

    #[test]
    fn load_task_keeps_the_graphic() {
        let generator = CountingImage::new();
        let task = GraphicLoadTask::spawn(
            &InlineExecutor,
            TaskPriority::Low,
            Box::new(ImageGraphic::new(generator.clone(), false)),
        );
        assert_eq!(task.source(), generator.id);
        assert_eq!(task.status(), TaskStatus::Finished);
        let graphic = task.take_graphic().unwrap();
        assert!(graphic.buffer().is_some());
        assert_eq!(generator.decodes(), 1);
    }
}
