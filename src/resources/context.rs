use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::error;

use super::resource::Resource;
use super::ResourceError;
use crate::core::{Document, NodeId};
use crate::viewport::Viewport;
use crate::SchedulerConfig;

/// Sink for build and layout failures.
pub type ErrorCallback = Arc<dyn Fn(&ResourceError, NodeId) + Send + Sync>;

/// Per-document state shared by the coordinator, the owners registry and
/// every resource. Resources hold it weakly; once the document is gone they
/// behave as if detached.
pub struct DocumentContext {
    document: Arc<Document>,
    viewport: Arc<dyn Viewport>,
    config: SchedulerConfig,
    resources: DashMap<NodeId, Arc<Resource>>,
    order: RwLock<Vec<NodeId>>,
    owners: DashMap<NodeId, NodeId>,
    last_velocity: RwLock<f64>,
    next_id: AtomicU32,
    error_handler: RwLock<Option<ErrorCallback>>,
    started_at: Instant,
}

impl DocumentContext {
    pub(crate) fn new(
        document: Arc<Document>,
        viewport: Arc<dyn Viewport>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            document,
            viewport,
            config,
            resources: DashMap::new(),
            order: RwLock::new(Vec::new()),
            owners: DashMap::new(),
            last_velocity: RwLock::new(0.0),
            next_id: AtomicU32::new(1),
            error_handler: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn viewport(&self) -> &Arc<dyn Viewport> {
        &self.viewport
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn resource(&self, node: NodeId) -> Option<Arc<Resource>> {
        self.resources.get(&node).map(|entry| Arc::clone(entry.value()))
    }

    /// Resources in insertion order.
    pub fn resources(&self) -> Vec<Arc<Resource>> {
        let order = self.order.read().clone();
        order
            .into_iter()
            .filter_map(|node| self.resource(node))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub(crate) fn next_resource_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, resource: Arc<Resource>) {
        let node = resource.node_id();
        self.resources.insert(node, resource);
        self.order.write().push(node);
    }

    /// Drops the resource for `node`, pausing it if it was built and
    /// cancelling whatever it was waiting on. Owner registrations of `node`
    /// and of its unmanaged descendants go with it.
    pub(crate) fn remove_resource(&self, node: NodeId) -> Option<Arc<Resource>> {
        let (_, resource) = self.resources.remove(&node)?;
        self.order.write().retain(|candidate| *candidate != node);
        self.owners.remove(&node);
        for descendant in self.document.descendants(node) {
            match self.resource(descendant) {
                Some(managed) => managed.update_owner(None),
                None => {
                    self.owners.remove(&descendant);
                }
            }
        }
        if resource.is_built() {
            resource.pause_on_remove();
        }
        resource.abort_layout();
        resource.cancel_viewport_waiters();
        Some(resource)
    }

    /// Explicitly registered owner of `node`, without walking ancestors.
    pub fn registered_owner(&self, node: NodeId) -> Option<NodeId> {
        self.owners.get(&node).map(|entry| *entry.value())
    }

    pub(crate) fn register_owner(&self, node: NodeId, owner: NodeId) {
        self.owners.insert(node, owner);
    }

    pub fn last_velocity(&self) -> f64 {
        *self.last_velocity.read()
    }

    pub(crate) fn set_last_velocity(&self, velocity: f64) {
        *self.last_velocity.write() = velocity;
    }

    /// `-1.0` while scrolling up, `1.0` otherwise.
    pub fn scroll_direction(&self) -> f64 {
        if self.last_velocity() < 0.0 {
            -1.0
        } else {
            1.0
        }
    }

    /// Milliseconds since the context was created.
    pub fn now_ms(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() * 1000.0
    }

    pub(crate) fn set_error_handler(&self, handler: Option<ErrorCallback>) {
        *self.error_handler.write() = handler;
    }

    /// Routes a failure to the error channel. Cancellations are dropped.
    pub fn report_error(&self, err: &ResourceError, node: NodeId) {
        if err.is_cancellation() {
            return;
        }
        let handler = self.error_handler.read().clone();
        if let Some(cb) = handler {
            cb(err, node);
        } else {
            error!(%node, "{err}");
        }
    }
}

impl fmt::Debug for DocumentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentContext")
            .field("resources", &self.resources.len())
            .field("owners", &self.owners.len())
            .field("last_velocity", &self.last_velocity())
            .field("config", &self.config)
            .finish()
    }
}
