// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracking which nodes wait on which deferred graphics.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use peniko::kurbo::BezPath;
use smallvec::SmallVec;

use crate::buffer::PixelBuffer;
use crate::executor::Executor;
use crate::gpu::GpuDevice;
use crate::source::{
    DeferredGraphic, GraphicLoadTask, ImageGenerator, ImageGraphic, Shape, ShapeGraphic, SourceId,
};
use crate::task::{TaskPriority, TaskStatus};

/// Stable identity of a scene node registered with a [`GraphicsLoader`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(NonZeroU64);

impl NodeId {
    /// A process-unique id. Never reused.
    pub fn next() -> Self {
        // We initialize with 1 so that the conversion below succeeds
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(NonZeroU64::new(ID_COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap())
    }
}

/// A scene node whose content can wait on deferred graphics.
pub trait AsyncNode {
    /// Stable identity of the node, used to key its registration.
    fn node_id(&self) -> NodeId;

    /// Called once every deferred graphic this node asked for has been loaded.
    ///
    /// The node is expected to rebuild its content, which now finds the loaded graphics in the
    /// loader's cache.
    fn invalidate_async_content(&self);
}

/// The drawable content of a node, which may reference deferred graphics.
pub trait LayerContent {
    /// Asks `collector` for every image and shape this content needs.
    ///
    /// Returns whether any of them had to be deferred. The loader only trusts the requests it
    /// actually received, so this is informational.
    fn collect_deferred_graphics(
        &self,
        collector: &mut ContentCollector<'_>,
        device: Option<&dyn GpuDevice>,
    ) -> bool;
}

/// Options for a [`GraphicsLoader`].
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// How many loads may be in flight before [`GraphicsLoader::on_detach`] stops dispatching.
    ///
    /// Zero pauses dispatch entirely.
    pub max_async_graphics_per_frame: usize,
    /// How many completed nodes are collected before they are notified while other loads are
    /// still in flight. Once nothing is in flight, completed nodes are always notified.
    pub notify_batch_size: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_async_graphics_per_frame: 4,
            notify_batch_size: 10,
        }
    }
}

/// A snapshot of the loader's bookkeeping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Nodes with at least one unresolved graphic.
    pub registered_nodes: usize,
    /// Registered nodes whose loads haven't been dispatched yet.
    pub pending_nodes: usize,
    /// Graphics waiting to be dispatched.
    pub pending_graphics: usize,
    /// Loads dispatched and not yet swept.
    pub in_flight: usize,
    /// Loaded graphics available to content collection.
    pub cached_graphics: usize,
    /// Nodes which finished loading but haven't been notified yet.
    pub completed_nodes: usize,
}

struct NodeEntry {
    node: Arc<dyn AsyncNode>,
    sources: SmallVec<[SourceId; 4]>,
}

/// Defers the loading of images and shapes referenced by scene nodes to an [`Executor`].
///
/// The loader is driven from the device thread: nodes register their content with
/// [`add_async_content`](Self::add_async_content), [`on_detach`](Self::on_detach) dispatches
/// loads at the end of a frame and [`on_attach`](Self::on_attach) collects finished loads at the
/// start of the next one.
///
/// Loads are deduplicated by [`SourceId`], so a source shared by many nodes is loaded once.
pub struct GraphicsLoader {
    executor: Arc<dyn Executor>,
    options: LoaderOptions,
    nodes: HashMap<NodeId, NodeEntry>,
    source_nodes: HashMap<SourceId, SmallVec<[NodeId; 2]>>,
    pending_nodes: VecDeque<NodeId>,
    pending_graphics: HashMap<SourceId, Box<dyn DeferredGraphic>>,
    in_flight: HashMap<SourceId, GraphicLoadTask>,
    completed_nodes: Vec<(NodeId, Arc<dyn AsyncNode>)>,
    // `None` marks a load which panicked, so collection stops deferring it.
    completed: HashMap<SourceId, Option<Box<dyn DeferredGraphic>>>,
}

impl Debug for GraphicsLoader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsLoader")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl GraphicsLoader {
    /// A loader dispatching its loads on `executor`.
    pub fn new(executor: Arc<dyn Executor>, options: LoaderOptions) -> Self {
        Self {
            executor,
            options,
            nodes: HashMap::new(),
            source_nodes: HashMap::new(),
            pending_nodes: VecDeque::new(),
            pending_graphics: HashMap::new(),
            in_flight: HashMap::new(),
            completed_nodes: Vec::new(),
            completed: HashMap::new(),
        }
    }

    /// The cap on loads in flight, see [`LoaderOptions::max_async_graphics_per_frame`].
    pub fn max_async_graphics_per_frame(&self) -> usize {
        self.options.max_async_graphics_per_frame
    }

    /// Changes the cap from the next [`on_detach`](Self::on_detach) on. Loads already in
    /// flight are not affected.
    pub fn set_max_async_graphics_per_frame(&mut self, max: usize) {
        self.options.max_async_graphics_per_frame = max;
    }

    /// Collects the deferred graphics of `content` on behalf of `node`.
    ///
    /// Returns `true` if anything had to be deferred, in which case `node` is notified through
    /// [`AsyncNode::invalidate_async_content`] once all of it has loaded. Returns `false` if
    /// there is no content, nothing was deferred, or `node` is already registered.
    pub fn add_async_content(
        &mut self,
        node: &Arc<dyn AsyncNode>,
        content: Option<&dyn LayerContent>,
        device: Option<&dyn GpuDevice>,
    ) -> bool {
        let Some(content) = content else {
            return false;
        };
        let id = node.node_id();
        if self.nodes.contains_key(&id) {
            log::warn!("Node {id:?} is already waiting on deferred graphics");
            return false;
        }
        self.nodes.insert(
            id,
            NodeEntry {
                node: Arc::clone(node),
                sources: SmallVec::new(),
            },
        );
        let reported = content.collect_deferred_graphics(
            &mut ContentCollector {
                loader: &mut *self,
                node: Some(id),
            },
            device,
        );
        let deferred = self
            .nodes
            .get(&id)
            .is_some_and(|entry| !entry.sources.is_empty());
        if reported != deferred {
            log::trace!("Node {id:?} reported {reported} but deferred {deferred}");
        }
        if !deferred {
            self.nodes.remove(&id);
            return false;
        }
        self.pending_nodes.push_back(id);
        true
    }

    /// Forgets everything `node` was waiting on.
    ///
    /// Loads no other node needs any more are canceled. A load which already started runs to
    /// completion, but its result is never looked at. Canceling an unknown node does nothing.
    pub fn cancel_async_content(&mut self, node: NodeId) {
        self.completed_nodes.retain(|(id, _)| *id != node);
        let Some(entry) = self.nodes.remove(&node) else {
            return;
        };
        self.pending_nodes.retain(|id| *id != node);
        for source in entry.sources {
            let Some(nodes) = self.source_nodes.get_mut(&source) else {
                continue;
            };
            nodes.retain(|id| *id != node);
            if !nodes.is_empty() {
                continue;
            }
            self.source_nodes.remove(&source);
            self.pending_graphics.remove(&source);
            if let Some(task) = self.in_flight.remove(&source) {
                let outcome = task.cancel();
                log::trace!("Canceled load of {source:?}: {outcome:?}");
            }
        }
    }

    /// Looks up a loaded image without deferring anything on a miss.
    pub fn load_image(&self, generator: &Arc<dyn ImageGenerator>) -> Option<Arc<PixelBuffer>> {
        self.completed.get(&generator.source_id())?.as_ref()?.buffer()
    }

    /// Looks up a loaded shape outline without deferring anything on a miss.
    pub fn load_shape(&self, shape: &Arc<dyn Shape>) -> Option<BezPath> {
        self.completed.get(&shape.source_id())?.as_ref()?.path()
    }

    /// Sweeps finished loads into the cache and notifies nodes which have everything they need.
    ///
    /// A load whose work panicked counts as done: its nodes are released and the source is
    /// cached as a miss until the cache is cleared.
    ///
    /// Call at the start of a frame. While loads are still in flight, notification is held back
    /// until [`LoaderOptions::notify_batch_size`] nodes have completed.
    pub fn on_attach(&mut self) {
        let finished: Vec<SourceId> = self
            .in_flight
            .iter()
            .filter(|(_, task)| {
                matches!(task.status(), TaskStatus::Finished | TaskStatus::Failed)
            })
            .map(|(source, _)| *source)
            .collect();
        for source in finished {
            let Some(task) = self.in_flight.remove(&source) else {
                continue;
            };
            for node in self.source_nodes.remove(&source).unwrap_or_default() {
                let Some(entry) = self.nodes.get_mut(&node) else {
                    continue;
                };
                entry.sources.retain(|id| *id != source);
                if entry.sources.is_empty() {
                    self.pending_nodes.retain(|id| *id != node);
                    if let Some(entry) = self.nodes.remove(&node) {
                        if !self.completed_nodes.iter().any(|(id, _)| *id == node) {
                            self.completed_nodes.push((node, entry.node));
                        }
                    }
                }
            }
            let graphic = task.take_graphic();
            if graphic.is_none() {
                log::warn!("Load of {source:?} failed, its nodes continue without it");
            }
            self.completed.insert(source, graphic);
        }

        if !self.in_flight.is_empty() && self.completed_nodes.len() < self.options.notify_batch_size
        {
            return;
        }
        if !self.completed_nodes.is_empty() {
            log::debug!(
                "Notifying {} nodes of loaded graphics",
                self.completed_nodes.len()
            );
        }
        for (_, node) in std::mem::take(&mut self.completed_nodes) {
            node.invalidate_async_content();
        }
    }

    /// Dispatches pending loads, node by node, until the in-flight cap is reached.
    ///
    /// Call at the end of a frame, once the device is no longer in use. When nothing is left in
    /// flight afterwards, the cache is cleared: every node which could have used it has already
    /// been notified.
    pub fn on_detach(&mut self) {
        let mut dispatched = 0;
        while self.in_flight.len() < self.options.max_async_graphics_per_frame {
            let Some(node) = self.pending_nodes.pop_front() else {
                break;
            };
            let Some(entry) = self.nodes.get(&node) else {
                continue;
            };
            for source in &entry.sources {
                if let Some(graphic) = self.pending_graphics.remove(source) {
                    let task = GraphicLoadTask::spawn(&*self.executor, TaskPriority::Low, graphic);
                    self.in_flight.insert(*source, task);
                    dispatched += 1;
                }
            }
        }
        if dispatched > 0 {
            log::debug!(
                "Dispatched {dispatched} graphic loads, {} nodes still pending",
                self.pending_nodes.len()
            );
        }
        if self.in_flight.is_empty() {
            self.completed.clear();
        }
    }

    /// Whether anything is queued, loading, or waiting to be notified.
    ///
    /// Frame drivers can use this to keep scheduling frames until loading settles.
    pub fn has_pending_work(&self) -> bool {
        !self.pending_nodes.is_empty()
            || !self.in_flight.is_empty()
            || !self.completed_nodes.is_empty()
    }

    /// Current bookkeeping counts.
    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            registered_nodes: self.nodes.len(),
            pending_nodes: self.pending_nodes.len(),
            pending_graphics: self.pending_graphics.len(),
            in_flight: self.in_flight.len(),
            cached_graphics: self.completed.len(),
            completed_nodes: self.completed_nodes.len(),
        }
    }

    fn defer(
        &mut self,
        node: NodeId,
        source: SourceId,
        graphic: impl FnOnce() -> Box<dyn DeferredGraphic>,
    ) {
        let Some(entry) = self.nodes.get_mut(&node) else {
            return;
        };
        if entry.sources.contains(&source) {
            return;
        }
        entry.sources.push(source);
        self.source_nodes.entry(source).or_default().push(node);
        if !self.pending_graphics.contains_key(&source) && !self.in_flight.contains_key(&source) {
            self.pending_graphics.insert(source, graphic());
        }
    }
}

impl Drop for GraphicsLoader {
    fn drop(&mut self) {
        for task in self.in_flight.values() {
            task.cancel();
        }
    }
}

/// Resolves graphics while a node's content is being collected.
///
/// A hit returns the loaded graphic. A miss registers the source as a dependency of the node
/// being collected and defers its load.
pub struct ContentCollector<'a> {
    loader: &'a mut GraphicsLoader,
    node: Option<NodeId>,
}

impl Debug for ContentCollector<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCollector")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl<'a> ContentCollector<'a> {
    /// A collector without a current node, for which every call is a plain cache lookup.
    pub fn detached(loader: &'a mut GraphicsLoader) -> Self {
        Self { loader, node: None }
    }

    /// The node whose content is being collected.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node
    }

    /// The decoded pixels of `generator`, if they have been loaded.
    ///
    /// A cached failed decode, or a load which panicked, also returns `None`, but isn't deferred
    /// again until the cache is cleared.
    pub fn load_image(
        &mut self,
        generator: &Arc<dyn ImageGenerator>,
        try_hardware: bool,
    ) -> Option<Arc<PixelBuffer>> {
        let source = generator.source_id();
        if let Some(graphic) = self.loader.completed.get(&source) {
            return graphic.as_ref()?.buffer();
        }
        if let Some(node) = self.node {
            self.loader.defer(node, source, || {
                Box::new(ImageGraphic::new(Arc::clone(generator), try_hardware))
            });
        }
        None
    }

    /// The outline of `shape`, if it has been loaded.
    pub fn load_shape(&mut self, shape: &Arc<dyn Shape>) -> Option<BezPath> {
        let source = shape.source_id();
        if let Some(graphic) = self.loader.completed.get(&source) {
            return graphic.as_ref()?.path();
        }
        if let Some(node) = self.node {
            self.loader
                .defer(node, source, || Box::new(ShapeGraphic::new(Arc::clone(shape))));
        }
        None
    }
}
