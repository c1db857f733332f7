// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame-driven scenarios for the graphics loader on a real worker pool.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use vello_prep::kurbo::{BezPath, Circle, Shape as _};
use vello_prep::{
    AsyncNode, ContentCollector, ExecutorOptions, GpuDevice, GraphicsLoader, ImageFormat,
    ImageGenerator, ImageInfo, LayerContent, LoaderOptions, NodeId, PixelBuffer, Shape, SourceId,
    ThreadPoolExecutor,
};

struct Node {
    id: NodeId,
    invalidations: AtomicUsize,
}

impl Node {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NodeId::next(),
            invalidations: AtomicUsize::new(0),
        })
    }

    fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl AsyncNode for Node {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn invalidate_async_content(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Produces a solid 8x8 image after an optional handshake with the test.
struct Image {
    id: SourceId,
    decodes: AtomicUsize,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl Image {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SourceId::next(),
            decodes: AtomicUsize::new(0),
            gate: None,
        })
    }

    /// An image whose decode announces itself on `started` and then blocks until `release`.
    fn gated(started: Sender<()>, release: Receiver<()>) -> Arc<Self> {
        Arc::new(Self {
            id: SourceId::next(),
            decodes: AtomicUsize::new(0),
            gate: Some((started, release)),
        })
    }

    fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl ImageGenerator for Image {
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn make_buffer(&self, _try_hardware: bool) -> Option<Arc<PixelBuffer>> {
        if let Some((started, release)) = &self.gate {
            started.send(()).unwrap();
            release.recv().unwrap();
        }
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let info = ImageInfo::new(8, 8, ImageFormat::Rgba8);
        Some(Arc::new(PixelBuffer::from_pixels(info, vec![0xff; 8 * 8 * 4]).unwrap()))
    }
}

struct Outline {
    id: SourceId,
    circle: Circle,
}

impl Shape for Outline {
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn path(&self) -> BezPath {
        self.circle.to_path(0.1)
    }
}

/// Content drawing some images and shapes, which remembers what it could draw last time.
#[derive(Default)]
struct Content {
    images: Vec<Arc<dyn ImageGenerator>>,
    shapes: Vec<Arc<dyn Shape>>,
    drawn: AtomicUsize,
}

impl LayerContent for Content {
    fn collect_deferred_graphics(
        &self,
        collector: &mut ContentCollector<'_>,
        _device: Option<&dyn GpuDevice>,
    ) -> bool {
        let mut drawn = 0;
        for image in &self.images {
            drawn += usize::from(collector.load_image(image, false).is_some());
        }
        for shape in &self.shapes {
            drawn += usize::from(collector.load_shape(shape).is_some());
        }
        self.drawn.store(drawn, Ordering::SeqCst);
        drawn < self.images.len() + self.shapes.len()
    }
}

fn pool(threads: usize) -> Arc<ThreadPoolExecutor> {
    Arc::new(
        ThreadPoolExecutor::new(ExecutorOptions {
            num_threads: NonZeroUsize::new(threads),
        })
        .unwrap(),
    )
}

/// Runs frames until `done` holds. Panics after a generous timeout.
fn run_frames(loader: &mut GraphicsLoader, mut done: impl FnMut(&GraphicsLoader) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        loader.on_attach();
        if done(&*loader) {
            return;
        }
        loader.on_detach();
        assert!(Instant::now() < deadline, "loader did not settle: {loader:?}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn shared_image_is_decoded_once() {
    let mut loader = GraphicsLoader::new(pool(2), LoaderOptions::default());
    let image = Image::new();
    let content = Content {
        images: vec![image.clone() as Arc<dyn ImageGenerator>],
        ..Default::default()
    };
    let (a, b) = (Node::new(), Node::new());
    let (node_a, node_b): (Arc<dyn AsyncNode>, Arc<dyn AsyncNode>) = (a.clone(), b.clone());

    assert!(loader.add_async_content(&node_a, Some(&content), None));
    assert!(loader.add_async_content(&node_b, Some(&content), None));
    loader.on_detach();
    assert_eq!(loader.stats().in_flight, 1);

    run_frames(&mut loader, |_| a.invalidations() > 0 && b.invalidations() > 0);
    assert_eq!(a.invalidations(), 1);
    assert_eq!(b.invalidations(), 1);

    // Rebuilding either node now draws from the cache.
    assert!(!loader.add_async_content(&node_a, Some(&content), None));
    assert!(!loader.add_async_content(&node_b, Some(&content), None));
    assert_eq!(content.drawn.load(Ordering::SeqCst), 1);
    let generator: Arc<dyn ImageGenerator> = image.clone();
    let buffer = loader.load_image(&generator).unwrap();
    assert_eq!(buffer.info().width(), 8);
    assert_eq!(image.decodes(), 1);
    assert!(!loader.has_pending_work());
}

#[test]
fn burst_of_nodes_drains_under_the_cap() {
    let mut loader = GraphicsLoader::new(
        pool(4),
        LoaderOptions {
            max_async_graphics_per_frame: 3,
            notify_batch_size: 4,
        },
    );
    let nodes: Vec<_> = (0..20).map(|_| Node::new()).collect();
    let contents: Vec<_> = (0..20)
        .map(|i| Content {
            images: vec![Image::new() as Arc<dyn ImageGenerator>],
            shapes: vec![Arc::new(Outline {
                id: SourceId::next(),
                circle: Circle::new((0.0, 0.0), f64::from(i) + 1.0),
            }) as Arc<dyn Shape>],
            ..Default::default()
        })
        .collect();
    for (node, content) in nodes.iter().zip(&contents) {
        let node: Arc<dyn AsyncNode> = node.clone();
        assert!(loader.add_async_content(&node, Some(content), None));
    }

    loader.on_detach();
    // Each node needs two loads, so dispatch stops after the second node.
    assert_eq!(loader.stats().in_flight, 4);
    assert_eq!(loader.stats().pending_nodes, 18);

    run_frames(&mut loader, |loader| !loader.has_pending_work());
    assert!(nodes.iter().all(|node| node.invalidations() == 1));
    assert_eq!(loader.stats().registered_nodes, 0);
}

#[test]
fn load_canceled_while_running_is_discarded() {
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let image = Image::gated(started_tx, release_rx);
    let content = Content {
        images: vec![image.clone() as Arc<dyn ImageGenerator>],
        ..Default::default()
    };
    let node = Node::new();
    let handle: Arc<dyn AsyncNode> = node.clone();
    let mut loader = GraphicsLoader::new(pool(1), LoaderOptions::default());

    assert!(loader.add_async_content(&handle, Some(&content), None));
    loader.on_detach();
    started_rx.recv().unwrap();
    loader.cancel_async_content(node.id);
    release_tx.send(()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while image.decodes() == 0 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    loader.on_attach();
    assert_eq!(node.invalidations(), 0);
    assert_eq!(loader.stats().cached_graphics, 0);

    // The result was never promoted, so registering again defers a new load.
    assert!(loader.add_async_content(&handle, Some(&content), None));
    assert_eq!(loader.stats().pending_graphics, 1);
    // Let the second decode through when it is dispatched.
    release_tx.send(()).unwrap();
    loader.on_detach();
    started_rx.recv().unwrap();
    run_frames(&mut loader, |_| node.invalidations() == 1);
    assert_eq!(image.decodes(), 2);
}

struct Corrupt(SourceId);

impl ImageGenerator for Corrupt {
    fn source_id(&self) -> SourceId {
        self.0
    }

    fn make_buffer(&self, _try_hardware: bool) -> Option<Arc<PixelBuffer>> {
        panic!("corrupt image stream");
    }
}

#[test]
fn panicking_decode_does_not_stall_the_frame_loop() {
    let mut loader = GraphicsLoader::new(pool(1), LoaderOptions::default());
    let corrupt: Arc<dyn ImageGenerator> = Arc::new(Corrupt(SourceId::next()));
    let image = Image::new();
    let broken = Content {
        images: vec![corrupt],
        ..Default::default()
    };
    let healthy = Content {
        images: vec![image.clone() as Arc<dyn ImageGenerator>],
        ..Default::default()
    };
    let (a, b) = (Node::new(), Node::new());
    let (node_a, node_b): (Arc<dyn AsyncNode>, Arc<dyn AsyncNode>) = (a.clone(), b.clone());
    assert!(loader.add_async_content(&node_a, Some(&broken), None));
    assert!(loader.add_async_content(&node_b, Some(&healthy), None));
    loader.on_detach();

    run_frames(&mut loader, |loader| !loader.has_pending_work());
    assert_eq!(a.invalidations(), 1);
    assert_eq!(b.invalidations(), 1);

    // The worker that hit the panic is still serving loads.
    let later = Image::new();
    let content = Content {
        images: vec![later.clone() as Arc<dyn ImageGenerator>],
        ..Default::default()
    };
    let c = Node::new();
    let node_c: Arc<dyn AsyncNode> = c.clone();
    assert!(loader.add_async_content(&node_c, Some(&content), None));
    loader.on_detach();
    run_frames(&mut loader, |_| c.invalidations() == 1);
    assert_eq!(later.decodes(), 1);
}
