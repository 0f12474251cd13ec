//! Per-document resource scheduling: the `Resource` state machine, the
//! `Owners` delegation registry and the `Resources` coordinator that drives
//! build, measure and layout passes.

pub mod context;
pub mod owners;
pub mod resource;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::core::{Document, NodeId};
use crate::element::{AmpElement, ElementError};
use crate::viewport::Viewport;
use crate::SchedulerConfig;

pub use context::{DocumentContext, ErrorCallback};
pub use owners::Owners;
pub use resource::{Resource, ViewportDistance};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("Not ready to start layout: {debug_id} ({state})")]
    NotReadyForLayout {
        debug_id: String,
        state: ResourceState,
    },
    #[error("Not displayed: {0}")]
    NotDisplayed(String),
    #[error("Not ready to start layout: {0}")]
    NotScheduled(String),
    #[error("Build failed: {0}")]
    Build(ElementError),
    #[error("Layout failed: {0}")]
    Layout(ElementError),
    #[error("CANCELLED")]
    Cancelled,
    #[error("Element is not managed: {0}")]
    UnknownElement(NodeId),
    #[error("Element is already managed: {0}")]
    AlreadyManaged(NodeId),
    #[error("Owner {owner} must contain {element}")]
    OwnerNotAncestor { element: NodeId, owner: NodeId },
}

impl ResourceError {
    /// Cancellations are expected and never surface as failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ResourceError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ResourceError>;

/// Resource lifecycle. Forward only, except that unlayout returns a laid
/// out resource to `NotLaidOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    NotBuilt,
    NotLaidOut,
    ReadyForLayout,
    LayoutScheduled,
    LayoutComplete,
    LayoutFailed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::NotBuilt => "NOT_BUILT",
            ResourceState::NotLaidOut => "NOT_LAID_OUT",
            ResourceState::ReadyForLayout => "READY_FOR_LAYOUT",
            ResourceState::LayoutScheduled => "LAYOUT_SCHEDULED",
            ResourceState::LayoutComplete => "LAYOUT_COMPLETE",
            ResourceState::LayoutFailed => "LAYOUT_FAILED",
        };
        f.write_str(name)
    }
}

/// Outcome of a build, layout or wait. Cloneable so every waiter observes
/// the same result.
pub type ResourceFuture = Shared<BoxFuture<'static, Result<()>>>;

/// An already settled [`ResourceFuture`].
pub fn settled(outcome: Result<()>) -> ResourceFuture {
    future::ready(outcome).boxed().shared()
}

/// A pending [`ResourceFuture`] and the sender that settles it. Dropping the
/// sender settles the future with [`ResourceError::Cancelled`].
pub(crate) fn deferred() -> (oneshot::Sender<Result<()>>, ResourceFuture) {
    let (sender, receiver) = oneshot::channel();
    let future = async move { receiver.await.unwrap_or(Err(ResourceError::Cancelled)) }
        .boxed()
        .shared();
    (sender, future)
}

/// Scroll information reported by the viewport service.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewportChange {
    /// Signed scroll velocity in px/ms. Positive is downward.
    pub velocity: f64,
    /// Set when the viewport width changed and every box may have moved.
    pub relayout_all: bool,
}

/// Work discovered by the synchronous half of a pass.
pub struct PassWork {
    pub measured: usize,
    pub layouts: Vec<(NodeId, ResourceFuture)>,
}

impl fmt::Debug for PassWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<NodeId> = self.layouts.iter().map(|(node, _)| *node).collect();
        f.debug_struct("PassWork")
            .field("measured", &self.measured)
            .field("layouts", &nodes)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PassSummary {
    pub built: usize,
    pub build_failures: usize,
    pub measured: usize,
    pub scheduled: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Coordinator for every resource of one document.
pub struct Resources {
    context: Arc<DocumentContext>,
    relayout_all: AtomicBool,
    pass_count: AtomicU64,
    first_pass_sender: Mutex<Option<oneshot::Sender<Result<()>>>>,
    first_pass: ResourceFuture,
}

impl Resources {
    pub fn new(
        document: Arc<Document>,
        viewport: Arc<dyn Viewport>,
        config: SchedulerConfig,
    ) -> Self {
        let (sender, first_pass) = deferred();
        Self {
            context: Arc::new(DocumentContext::new(document, viewport, config)),
            relayout_all: AtomicBool::new(false),
            pass_count: AtomicU64::new(0),
            first_pass_sender: Mutex::new(Some(sender)),
            first_pass,
        }
    }

    pub fn context(&self) -> &Arc<DocumentContext> {
        &self.context
    }

    pub fn document(&self) -> &Arc<Document> {
        self.context.document()
    }

    pub fn owners(&self) -> Owners {
        Owners::new(Arc::clone(&self.context))
    }

    /// Starts managing `node`.
    pub fn add(&self, node: NodeId, element: Arc<dyn AmpElement>) -> Result<Arc<Resource>> {
        if !self.document().contains_node(node) {
            return Err(ResourceError::UnknownElement(node));
        }
        if self.context.resource(node).is_some() {
            return Err(ResourceError::AlreadyManaged(node));
        }
        let id = self.context.next_resource_id();
        let resource = Resource::new(id, node, element, &self.context);
        self.context.insert(Arc::clone(&resource));
        debug!(resource = %resource.debug_id(), state = %resource.state(), "resource added");
        Ok(resource)
    }

    /// The element finished upgrading; builds it right away.
    pub fn upgraded(&self, node: NodeId) -> Result<Option<ResourceFuture>> {
        let resource = self.get(node)?;
        debug!(resource = %resource.debug_id(), "element upgraded");
        Ok(resource.build())
    }

    pub fn remove(&self, node: NodeId) -> Option<Arc<Resource>> {
        let removed = self.context.remove_resource(node);
        if let Some(resource) = &removed {
            debug!(resource = %resource.debug_id(), "resource removed");
        }
        removed
    }

    pub fn get(&self, node: NodeId) -> Result<Arc<Resource>> {
        self.context
            .resource(node)
            .ok_or(ResourceError::UnknownElement(node))
    }

    pub fn get_optional(&self, node: NodeId) -> Option<Arc<Resource>> {
        self.context.resource(node)
    }

    /// All resources in insertion order.
    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.context.resources()
    }

    pub fn len(&self) -> usize {
        self.context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_viewport_changed(&self, change: ViewportChange) {
        trace!(velocity = change.velocity, relayout_all = change.relayout_all, "viewport changed");
        self.context.set_last_velocity(change.velocity);
        if change.relayout_all && self.context.config().relayout_on_resize {
            self.relayout_all.store(true, Ordering::Release);
        }
    }

    pub fn last_velocity(&self) -> f64 {
        self.context.last_velocity()
    }

    pub fn scroll_direction(&self) -> f64 {
        self.context.scroll_direction()
    }

    /// Replaces the error channel. `None` restores the default, which logs.
    pub fn set_error_handler<F>(&self, cb: Option<F>)
    where
        F: Fn(&ResourceError, NodeId) + Send + Sync + 'static,
    {
        self.context
            .set_error_handler(cb.map(|f| Arc::new(f) as ErrorCallback));
    }

    /// Settles once the first pass has finished.
    pub fn when_first_pass(&self) -> ResourceFuture {
        self.first_pass.clone()
    }

    pub fn pass_count(&self) -> u64 {
        self.pass_count.load(Ordering::Acquire)
    }

    /// Starts building every upgraded resource that is not built yet.
    /// Resources whose build failed are skipped.
    pub fn start_builds(&self) -> Vec<ResourceFuture> {
        self.resources()
            .iter()
            .filter(|resource| {
                resource.state() == ResourceState::NotBuilt && !resource.has_build_failed()
            })
            .filter_map(|resource| resource.build())
            .collect()
    }

    /// Measures, refreshes in-viewport flags and starts layouts. Does not
    /// wait for anything. Resources detached from the document are skipped
    /// until they are reattached or removed.
    pub fn discover_work(&self, now_ms: f64) -> PassWork {
        let relayout_all = self.relayout_all.swap(false, Ordering::AcqRel);
        let document = self.context.document();
        let resources: Vec<Arc<Resource>> = self
            .resources()
            .into_iter()
            .filter(|resource| document.is_connected(resource.node_id()))
            .collect();
        let config = self.context.config();

        let mut measured = 0;
        for resource in &resources {
            if relayout_all || resource.is_measure_requested() || !resource.has_been_measured() {
                resource.measure();
                measured += 1;
            }
        }

        let viewport_rect = self.context.viewport().rect();
        for resource in &resources {
            let visible =
                resource.is_displayed() && resource.layout_box().overlaps(&viewport_rect);
            resource.set_in_viewport(visible);
        }

        let ready: Vec<(usize, &Arc<Resource>)> = resources
            .iter()
            .enumerate()
            .filter(|(_, resource)| {
                resource.state() == ResourceState::ReadyForLayout
                    && resource.is_displayed()
                    && !resource.has_owner()
            })
            .collect();

        let mut candidates: Vec<(usize, &Arc<Resource>)> = ready
            .iter()
            .copied()
            .filter(|(_, resource)| resource.is_in_viewport() || resource.render_outside_viewport())
            .collect();

        let mut idle = false;
        if candidates.is_empty()
            && config.idle_render_outside_viewport
            && !resources.iter().any(|resource| resource.is_layout_in_flight())
        {
            candidates = ready
                .iter()
                .copied()
                .filter(|(_, resource)| resource.idle_render_outside_viewport())
                .collect();
            idle = !candidates.is_empty();
        }

        candidates.sort_by_key(|(index, resource)| (resource.layout_priority(), *index));
        candidates.truncate(config.max_layouts_per_pass);

        let mut layouts = Vec::with_capacity(candidates.len());
        for (_, resource) in candidates {
            resource.layout_scheduled(now_ms);
            match resource.start_layout() {
                Ok(future) => layouts.push((resource.node_id(), future)),
                Err(error) => self.context.report_error(&error, resource.node_id()),
            }
        }

        debug!(measured, scheduled = layouts.len(), idle, relayout_all, "pass work discovered");
        PassWork { measured, layouts }
    }

    /// Runs one full pass: builds, then measurement and layout scheduling,
    /// then waits for every layout it started.
    pub async fn do_pass(&self, now_ms: f64) -> PassSummary {
        let pass = self.pass_count.fetch_add(1, Ordering::AcqRel) + 1;
        let mut summary = PassSummary::default();

        let builds = self.start_builds();
        for outcome in future::join_all(builds).await {
            match outcome {
                Ok(()) => summary.built += 1,
                Err(_) => summary.build_failures += 1,
            }
        }

        let work = self.discover_work(now_ms);
        summary.measured = work.measured;
        summary.scheduled = work.layouts.len();

        let layouts = work.layouts.into_iter().map(|(_, future)| future);
        for outcome in future::join_all(layouts).await {
            match outcome {
                Ok(()) => summary.completed += 1,
                Err(error) if error.is_cancellation() => summary.cancelled += 1,
                Err(_) => summary.failed += 1,
            }
        }

        if let Some(sender) = self.first_pass_sender.lock().take() {
            let _ = sender.send(Ok(()));
        }
        info!(
            pass,
            built = summary.built,
            measured = summary.measured,
            scheduled = summary.scheduled,
            completed = summary.completed,
            failed = summary.failed,
            "pass finished"
        );
        summary
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("resources", &self.len())
            .field("last_velocity", &self.last_velocity())
            .field("pass_count", &self.pass_count())
            .finish()
    }
}
