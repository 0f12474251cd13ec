use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{self, AbortHandle, Aborted};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::context::DocumentContext;
use super::{deferred, settled, ResourceError, ResourceFuture, ResourceState, Result};
use crate::core::layout::{Layout, LayoutPriority, LayoutRect, Margins};
use crate::core::{NodeId, Position};
use crate::element::{guarded, AmpElement, ElementError, RenderOutsideViewport};

/// Where a box sits relative to the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewportDistance {
    InViewport,
    /// Entirely to the left or right of the viewport, or detached.
    OffAxis,
    /// Above or below. `ratio` is the gap in viewport heights and
    /// `scroll_penalty` is 2 while scrolling away from the box.
    Vertical { ratio: f64, scroll_penalty: f64 },
}

/// Whether `distance` satisfies the prefetch `hint`.
pub fn is_within(hint: RenderOutsideViewport, distance: ViewportDistance) -> bool {
    match hint {
        RenderOutsideViewport::Bool(flag) => flag,
        RenderOutsideViewport::Ratio(multiplier) => match distance {
            ViewportDistance::InViewport => true,
            ViewportDistance::OffAxis => false,
            ViewportDistance::Vertical {
                ratio,
                scroll_penalty,
            } => ratio < multiplier / scroll_penalty,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerCache {
    Unresolved,
    Resolved(Option<NodeId>),
}

struct PendingLayout {
    future: ResourceFuture,
    abort: AbortHandle,
}

struct ViewportWaiter {
    hint: RenderOutsideViewport,
    sender: oneshot::Sender<Result<()>>,
    future: ResourceFuture,
}

struct ResourceInner {
    state: ResourceState,
    layout_box: LayoutRect,
    initial_layout_box: Option<LayoutRect>,
    is_fixed: bool,
    is_in_viewport: bool,
    measure_requested: bool,
    owner: OwnerCache,
    priority: LayoutPriority,
    layout_count: u32,
    building: Option<ResourceFuture>,
    build_error: Option<ResourceError>,
    layout: Option<PendingLayout>,
    last_layout_error: Option<ResourceError>,
    viewport_waiters: HashMap<String, ViewportWaiter>,
    loaded_sender: Option<oneshot::Sender<Result<()>>>,
}

/// Scheduler-side wrapper around one managed element.
///
/// Locks are never held while element hooks run or across awaits.
pub struct Resource {
    id: u32,
    node: NodeId,
    debug_id: String,
    element: Arc<dyn AmpElement>,
    context: Weak<DocumentContext>,
    inner: Arc<RwLock<ResourceInner>>,
    loaded: ResourceFuture,
}

impl Resource {
    pub(crate) fn new(
        id: u32,
        node: NodeId,
        element: Arc<dyn AmpElement>,
        context: &Arc<DocumentContext>,
    ) -> Arc<Self> {
        let tag = context
            .document()
            .get_tag_name(node)
            .unwrap_or_else(|| "unknown".to_string());
        let state = if element.is_built() {
            ResourceState::NotLaidOut
        } else {
            ResourceState::NotBuilt
        };
        let (loaded_sender, loaded) = deferred();
        let resource = Arc::new(Self {
            id,
            node,
            debug_id: format!("{tag}#{id}"),
            context: Arc::downgrade(context),
            inner: Arc::new(RwLock::new(ResourceInner {
                state,
                layout_box: LayoutRect::ZERO,
                initial_layout_box: None,
                is_fixed: false,
                is_in_viewport: false,
                measure_requested: false,
                owner: OwnerCache::Unresolved,
                priority: element.layout_priority(),
                layout_count: 0,
                building: None,
                build_error: None,
                layout: None,
                last_layout_error: None,
                viewport_waiters: HashMap::new(),
                loaded_sender: Some(loaded_sender),
            })),
            element,
            loaded,
        });
        if state == ResourceState::NotBuilt && resource.element.is_building() {
            let _ = resource.build();
        }
        resource
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// `<tag>#<id>`, used in logs and errors.
    pub fn debug_id(&self) -> &str {
        &self.debug_id
    }

    pub fn element(&self) -> &Arc<dyn AmpElement> {
        &self.element
    }

    pub fn state(&self) -> ResourceState {
        self.inner.read().state
    }

    pub fn is_built(&self) -> bool {
        self.state() != ResourceState::NotBuilt
    }

    pub fn is_building(&self) -> bool {
        self.inner.read().building.is_some()
    }

    /// A failed build is never retried.
    pub fn has_build_failed(&self) -> bool {
        self.inner.read().build_error.is_some()
    }

    pub fn layout_box(&self) -> LayoutRect {
        self.inner.read().layout_box
    }

    /// Box captured by the first measurement.
    pub fn initial_layout_box(&self) -> Option<LayoutRect> {
        self.inner.read().initial_layout_box
    }

    pub fn has_been_measured(&self) -> bool {
        self.inner.read().initial_layout_box.is_some()
    }

    pub fn is_measure_requested(&self) -> bool {
        self.inner.read().measure_requested
    }

    pub fn request_measure(&self) {
        self.inner.write().measure_requested = true;
    }

    pub fn is_fixed(&self) -> bool {
        self.inner.read().is_fixed
    }

    pub fn is_in_viewport(&self) -> bool {
        self.inner.read().is_in_viewport
    }

    pub fn set_in_viewport(&self, in_viewport: bool) {
        if in_viewport {
            self.resolve_viewport_waiters();
        }
        self.inner.write().is_in_viewport = in_viewport;
    }

    pub fn layout_priority(&self) -> LayoutPriority {
        self.inner.read().priority
    }

    pub fn update_layout_priority(&self, priority: LayoutPriority) {
        self.inner.write().priority = priority;
    }

    pub fn layout_count(&self) -> u32 {
        self.inner.read().layout_count
    }

    /// `true` until the first layout has completed or failed.
    pub fn is_layout_pending(&self) -> bool {
        !matches!(
            self.state(),
            ResourceState::LayoutComplete | ResourceState::LayoutFailed
        )
    }

    pub(crate) fn is_layout_in_flight(&self) -> bool {
        self.inner.read().layout.is_some()
    }

    pub fn last_layout_error(&self) -> Option<ResourceError> {
        self.inner.read().last_layout_error.clone()
    }

    /// Zero area only counts as displayed for fluid layouts.
    pub fn is_displayed(&self) -> bool {
        if self.context.strong_count() == 0 {
            return false;
        }
        let layout_box = self.layout_box();
        layout_box.has_area() || self.element.layout() == Layout::Fluid
    }

    /// Settles on the first layout outcome.
    pub fn loaded_once(&self) -> ResourceFuture {
        self.loaded.clone()
    }

    /// Builds the element once it is upgraded. Returns the in-flight build
    /// when one is running and `None` while the element is not upgraded.
    /// After a failure the same error is returned without calling the hook.
    pub fn build(&self) -> Option<ResourceFuture> {
        {
            let inner = self.inner.read();
            if let Some(building) = &inner.building {
                return Some(building.clone());
            }
            if let Some(err) = &inner.build_error {
                return Some(settled(Err(err.clone())));
            }
        }
        if !self.element.is_upgraded() {
            return None;
        }
        if self.state() != ResourceState::NotBuilt {
            return Some(settled(Ok(())));
        }

        debug!(resource = %self.debug_id, "build");
        let hook = guarded(self.element.build_internal());
        let element = Arc::clone(&self.element);
        let inner = Arc::clone(&self.inner);
        let context = self.context.clone();
        let node = self.node;
        let debug_id = self.debug_id.clone();
        let future = async move {
            let outcome = hook.await;
            let fluid = element.layout() == Layout::Fluid;
            match outcome {
                Ok(()) => {
                    let mut guard = inner.write();
                    guard.building = None;
                    let measured_and_displayed = guard.initial_layout_box.is_some()
                        && (guard.layout_box.has_area() || fluid);
                    guard.state = if measured_and_displayed {
                        ResourceState::ReadyForLayout
                    } else {
                        ResourceState::NotLaidOut
                    };
                    debug!(resource = %debug_id, state = %guard.state, "build complete");
                    Ok(())
                }
                Err(reason) => {
                    let err = ResourceError::Build(reason);
                    {
                        let mut guard = inner.write();
                        guard.building = None;
                        guard.build_error = Some(err.clone());
                        guard.state = ResourceState::NotBuilt;
                    }
                    warn!(resource = %debug_id, "{err}");
                    if let Some(context) = context.upgrade() {
                        context.report_error(&err, node);
                    }
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();
        self.inner.write().building = Some(future.clone());
        Some(future)
    }

    /// Reads the element's geometry and promotes it towards layout.
    pub fn measure(&self) {
        let Some(context) = self.context.upgrade() else {
            self.inner.write().state = ResourceState::NotBuilt;
            return;
        };
        if self.is_waiting_for_parent(&context) {
            trace!(resource = %self.debug_id, "placeholder parent not managed yet");
            return;
        }

        self.inner.write().measure_requested = false;
        let (layout_box, is_fixed) = self.compute_measurements(&context);
        let displayed = layout_box.has_area() || self.element.layout() == Layout::Fluid;
        let upgraded = self.element.is_upgraded();
        let relayout_needed = self.element.is_relayout_needed();

        let size_changed = {
            let mut inner = self.inner.write();
            let previous = inner.layout_box;
            let size_changed = !previous.size_equals(&layout_box);
            let needs_check = inner.state == ResourceState::NotLaidOut
                || previous.top != layout_box.top
                || size_changed;
            inner.layout_box = layout_box;
            inner.is_fixed = is_fixed;
            if needs_check && upgraded {
                match inner.state {
                    ResourceState::NotLaidOut if displayed => {
                        inner.state = ResourceState::ReadyForLayout;
                    }
                    ResourceState::LayoutComplete | ResourceState::LayoutFailed
                        if relayout_needed =>
                    {
                        inner.state = ResourceState::ReadyForLayout;
                    }
                    _ => {}
                }
            }
            if inner.initial_layout_box.is_none() {
                inner.initial_layout_box = Some(layout_box);
            }
            trace!(
                resource = %self.debug_id,
                state = %inner.state,
                top = layout_box.top,
                height = layout_box.height,
                is_fixed,
                "measured"
            );
            size_changed
        };

        self.element.update_layout_box(layout_box, size_changed);
        self.resolve_viewport_waiters();
    }

    /// Measures first if no measurement happened yet.
    pub async fn ensure_measured(&self) -> LayoutRect {
        if !self.has_been_measured() {
            self.measure();
        }
        self.layout_box()
    }

    /// A placeholder inside an AMP element waits until its parent is managed.
    fn is_waiting_for_parent(&self, context: &DocumentContext) -> bool {
        let document = context.document();
        if !document.is_placeholder(self.node) {
            return false;
        }
        match document.get_parent(self.node) {
            Some(parent) => document.is_amp_element(parent) && context.resource(parent).is_none(),
            None => false,
        }
    }

    fn compute_measurements(&self, context: &DocumentContext) -> (LayoutRect, bool) {
        let viewport = context.viewport();
        let layout_box = viewport.layout_rect(self.element.as_ref());
        let displayed = layout_box.has_area() || self.element.layout() == Layout::Fluid;
        if !displayed || !viewport.supports_position_fixed() {
            return (layout_box, false);
        }

        let document = context.document();
        let is_fixed = document.offset_chain(self.node).into_iter().any(|node| {
            let always_fixed = if node == self.node {
                self.element.is_always_fixed()
            } else {
                context
                    .resource(node)
                    .is_some_and(|resource| resource.element.is_always_fixed())
            };
            always_fixed
                || (viewport.is_declared_fixed(node)
                    && document.get_position(node) == Position::Fixed)
        });

        if is_fixed {
            let fixed_box = self
                .element
                .bounding_client_rect()
                .moved(0.0, viewport.scroll_top());
            (fixed_box, true)
        } else {
            (layout_box, false)
        }
    }

    /// Marks the resource as scheduled and tells the element when.
    pub fn layout_scheduled(&self, time_ms: f64) {
        self.inner.write().state = ResourceState::LayoutScheduled;
        trace!(resource = %self.debug_id, time_ms, "layout scheduled");
        self.element.layout_scheduled(time_ms);
    }

    /// Starts the layout hook. Calling again while it runs returns the same
    /// future; a finished layout is replayed without calling the hook.
    pub fn start_layout(&self) -> Result<ResourceFuture> {
        let (state, layout_count) = {
            let inner = self.inner.read();
            if let Some(pending) = &inner.layout {
                return Ok(pending.future.clone());
            }
            match inner.state {
                ResourceState::LayoutComplete => return Ok(settled(Ok(()))),
                ResourceState::LayoutFailed => {
                    let err = inner.last_layout_error.clone().unwrap_or_else(|| {
                        ResourceError::Layout(ElementError::Failed("unknown".to_string()))
                    });
                    return Ok(settled(Err(err)));
                }
                ResourceState::NotBuilt => {
                    return Err(ResourceError::NotReadyForLayout {
                        debug_id: self.debug_id.clone(),
                        state: inner.state,
                    });
                }
                _ => {}
            }
            (inner.state, inner.layout_count)
        };

        if !self.is_displayed() {
            return Err(ResourceError::NotDisplayed(self.debug_id.clone()));
        }

        if state != ResourceState::LayoutScheduled {
            let err = ResourceError::NotScheduled(self.debug_id.clone());
            self.report(&err);
            return Ok(settled(Err(err)));
        }

        if layout_count > 0 && !self.element.is_relayout_needed() {
            debug!(resource = %self.debug_id, "relayout not needed");
            self.inner.write().state = ResourceState::LayoutComplete;
            return Ok(settled(Ok(())));
        }

        debug!(resource = %self.debug_id, layout_count, "start layout");
        let (hook, abort) = future::abortable(guarded(self.element.layout_callback()));
        let inner = Arc::clone(&self.inner);
        let context = self.context.clone();
        let node = self.node;
        let debug_id = self.debug_id.clone();
        let future = async move {
            let outcome = match hook.await {
                Ok(outcome) => outcome.map_err(ResourceError::Layout),
                Err(Aborted) => return Err(ResourceError::Cancelled),
            };
            Self::layout_complete(&inner, &debug_id, &outcome);
            if let Err(err) = &outcome {
                if let Some(context) = context.upgrade() {
                    context.report_error(err, node);
                }
            }
            outcome
        }
        .boxed()
        .shared();

        let mut inner = self.inner.write();
        inner.layout_count += 1;
        inner.layout = Some(PendingLayout {
            future: future.clone(),
            abort,
        });
        Ok(future)
    }

    fn layout_complete(inner: &RwLock<ResourceInner>, debug_id: &str, outcome: &Result<()>) {
        let loaded = {
            let mut guard = inner.write();
            guard.layout = None;
            match outcome {
                Ok(()) => {
                    guard.state = ResourceState::LayoutComplete;
                    guard.last_layout_error = None;
                    debug!(resource = %debug_id, "layout complete");
                }
                Err(err) => {
                    guard.state = ResourceState::LayoutFailed;
                    guard.last_layout_error = Some(err.clone());
                    warn!(resource = %debug_id, "{err}");
                }
            }
            guard.loaded_sender.take()
        };
        if let Some(sender) = loaded {
            let _ = sender.send(outcome.clone());
        }
    }

    /// Cancels an in-flight layout. Its waiters observe `Cancelled` and the
    /// resource goes back to `ReadyForLayout` as if the attempt never started.
    pub(crate) fn abort_layout(&self) {
        let pending = {
            let mut inner = self.inner.write();
            let pending = inner.layout.take();
            if pending.is_some() {
                inner.layout_count = inner.layout_count.saturating_sub(1);
                if inner.state == ResourceState::LayoutScheduled {
                    inner.state = ResourceState::ReadyForLayout;
                }
            }
            pending
        };
        if let Some(pending) = pending {
            debug!(resource = %self.debug_id, "layout cancelled");
            pending.abort.abort();
        }
    }

    /// Releases the element's content. The state resets only when the
    /// element asks for it.
    pub fn unlayout(&self) {
        if self.state() == ResourceState::NotBuilt {
            return;
        }
        self.abort_layout();
        self.set_in_viewport(false);
        if self.element.unlayout_callback() {
            self.element.toggle_placeholder(true);
            let mut inner = self.inner.write();
            inner.state = ResourceState::NotLaidOut;
            inner.layout_count = 0;
            debug!(resource = %self.debug_id, "unlayout");
        }
    }

    pub fn unload(&self) {
        self.pause();
        self.unlayout();
    }

    pub fn pause(&self) {
        self.element.pause();
    }

    pub fn pause_on_remove(&self) {
        self.element.pause();
    }

    pub fn resume(&self) {
        self.element.resume();
    }

    /// Detaches the resource from its coordinator.
    pub fn disconnect(&self) {
        if let Some(context) = self.context.upgrade() {
            context.remove_resource(self.node);
        }
    }

    /// Hides the element, zeroes its box and notifies the owner.
    pub fn complete_collapse(&self) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        if let Err(err) = context.document().set_hidden(self.node, true) {
            warn!(resource = %self.debug_id, "{err}");
        }
        let layout_box = {
            let mut inner = self.inner.write();
            inner.layout_box = inner.layout_box.with_size(0.0, 0.0);
            inner.is_fixed = false;
            inner.layout_box
        };
        self.element.update_layout_box(layout_box, true);
        if let Some(owner) = self.owner() {
            match context.resource(owner) {
                Some(owner) => owner.element.collapsed_callback(self.node),
                None => trace!(
                    resource = %self.debug_id,
                    owner = %owner,
                    "owner is not managed, collapse not forwarded"
                ),
            }
        }
    }

    pub fn complete_expand(&self) {
        if let Some(context) = self.context.upgrade() {
            if let Err(err) = context.document().set_hidden(self.node, false) {
                warn!(resource = %self.debug_id, "{err}");
            }
        }
        self.request_measure();
    }

    pub fn change_size(&self, height: Option<f64>, width: Option<f64>, margins: Option<Margins>) {
        self.element.apply_size(height, width, margins);
        self.request_measure();
    }

    /// Nearest registered owner on the ancestor chain, cached until
    /// invalidated.
    pub fn owner(&self) -> Option<NodeId> {
        if let OwnerCache::Resolved(owner) = self.inner.read().owner {
            return owner;
        }
        let owner = self.context.upgrade().and_then(|context| {
            context
                .document()
                .ancestors(self.node)
                .into_iter()
                .find_map(|node| context.registered_owner(node))
        });
        self.inner.write().owner = OwnerCache::Resolved(owner);
        owner
    }

    pub fn has_owner(&self) -> bool {
        self.owner().is_some()
    }

    /// `Some` pins an explicit owner, `None` forces a fresh lookup.
    pub(crate) fn update_owner(&self, owner: Option<NodeId>) {
        self.inner.write().owner = match owner {
            Some(owner) => OwnerCache::Resolved(Some(owner)),
            None => OwnerCache::Unresolved,
        };
    }

    pub fn get_distance_viewport_ratio(&self) -> ViewportDistance {
        let Some(context) = self.context.upgrade() else {
            return ViewportDistance::OffAxis;
        };
        let viewport_box = context.viewport().rect();
        let layout_box = self.layout_box();
        let scroll_direction = context.scroll_direction();

        if viewport_box.right() < layout_box.left || viewport_box.left > layout_box.right() {
            return ViewportDistance::OffAxis;
        }
        let (distance, scroll_penalty) = if viewport_box.bottom() < layout_box.top {
            let penalty = if scroll_direction < 0.0 { 2.0 } else { 1.0 };
            (layout_box.top - viewport_box.bottom(), penalty)
        } else if viewport_box.top > layout_box.bottom() {
            let penalty = if scroll_direction > 0.0 { 2.0 } else { 1.0 };
            (viewport_box.top - layout_box.bottom(), penalty)
        } else {
            return ViewportDistance::InViewport;
        };
        let ratio = if viewport_box.height > 0.0 {
            distance / viewport_box.height
        } else {
            f64::INFINITY
        };
        ViewportDistance::Vertical {
            ratio,
            scroll_penalty,
        }
    }

    pub fn is_within_viewport_ratio(
        &self,
        hint: RenderOutsideViewport,
        distance: Option<ViewportDistance>,
    ) -> bool {
        if let RenderOutsideViewport::Bool(flag) = hint {
            return flag;
        }
        let distance = distance.unwrap_or_else(|| self.get_distance_viewport_ratio());
        is_within(hint, distance)
    }

    /// Whether the element may be laid out now. Owned elements always may.
    pub fn render_outside_viewport(&self) -> bool {
        self.resolve_viewport_waiters();
        self.has_owner()
            || self.is_within_viewport_ratio(self.element.render_outside_viewport(), None)
    }

    pub fn idle_render_outside_viewport(&self) -> bool {
        self.is_within_viewport_ratio(self.element.idle_render_outside_viewport(), None)
    }

    /// Settles once the element is within `hint` of the viewport. Waiters
    /// are shared per hint.
    pub fn when_within_viewport(&self, hint: RenderOutsideViewport) -> ResourceFuture {
        if !self.is_layout_pending() || hint == RenderOutsideViewport::Bool(true) {
            return settled(Ok(()));
        }
        let key = hint.key();
        if let Some(waiter) = self.inner.read().viewport_waiters.get(&key) {
            return waiter.future.clone();
        }
        if self.is_within_viewport_ratio(hint, None) {
            return settled(Ok(()));
        }
        let (sender, future) = deferred();
        self.inner.write().viewport_waiters.insert(
            key,
            ViewportWaiter {
                hint,
                sender,
                future: future.clone(),
            },
        );
        future
    }

    fn resolve_viewport_waiters(&self) {
        let hints: Vec<(String, RenderOutsideViewport)> = {
            let inner = self.inner.read();
            if inner.viewport_waiters.is_empty() {
                return;
            }
            inner
                .viewport_waiters
                .iter()
                .map(|(key, waiter)| (key.clone(), waiter.hint))
                .collect()
        };
        let distance = self.get_distance_viewport_ratio();
        let ready: Vec<ViewportWaiter> = {
            let mut inner = self.inner.write();
            hints
                .into_iter()
                .filter(|(_, hint)| is_within(*hint, distance))
                .filter_map(|(key, _)| inner.viewport_waiters.remove(&key))
                .collect()
        };
        for waiter in ready {
            trace!(resource = %self.debug_id, hint = %waiter.hint, "within viewport");
            let _ = waiter.sender.send(Ok(()));
        }
    }

    /// Drops every viewport waiter; their futures settle as cancelled.
    pub(crate) fn cancel_viewport_waiters(&self) {
        self.inner.write().viewport_waiters.clear();
    }

    fn report(&self, err: &ResourceError) {
        if let Some(context) = self.context.upgrade() {
            context.report_error(err, self.node);
        } else {
            warn!(resource = %self.debug_id, "{err}");
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Resource")
            .field("id", &self.debug_id)
            .field("state", &inner.state)
            .field("layout_box", &inner.layout_box)
            .field("is_fixed", &inner.is_fixed)
            .field("in_viewport", &inner.is_in_viewport)
            .finish()
    }
}
