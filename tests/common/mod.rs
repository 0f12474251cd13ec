#![allow(dead_code)]

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use amp_scheduler::{
    layout_rect_ltwh, AmpElement, Document, ElementError, HookFuture, Layout, LayoutPriority,
    LayoutRect, Margins, NodeId, RenderOutsideViewport, Resource, ResourceError, Resources,
    SchedulerConfig, StaticViewport, Viewport,
};

/// How a scripted hook settles.
#[derive(Debug, Clone, PartialEq)]
pub enum HookScript {
    Resolve,
    Reject(String),
    /// Stays pending until `FakeElement::resolve_layout` is called.
    Manual,
    Panic,
}

#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub build: usize,
    pub layout: usize,
    pub unlayout: usize,
    pub pause: usize,
    pub resume: usize,
    pub placeholder: Vec<bool>,
    pub layout_boxes: Vec<(LayoutRect, bool)>,
    pub collapsed: Vec<NodeId>,
    pub scheduled_at: Vec<f64>,
    pub apply_size: Vec<(Option<f64>, Option<f64>, Option<Margins>)>,
}

struct FakeState {
    upgraded: bool,
    built: bool,
    building: bool,
    rect: LayoutRect,
    layout: Layout,
    relayout_needed: bool,
    unlayout_resets: bool,
    render_outside: RenderOutsideViewport,
    idle_render: RenderOutsideViewport,
    always_fixed: bool,
    priority: LayoutPriority,
    build_script: HookScript,
    layout_script: HookScript,
    manual_layout: Option<oneshot::Sender<Result<(), ElementError>>>,
    calls: Calls,
}

/// Scriptable element used across the integration tests.
pub struct FakeElement {
    state: Mutex<FakeState>,
}

impl FakeElement {
    /// Upgraded but not built, with a zero box.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                upgraded: true,
                built: false,
                building: false,
                rect: LayoutRect::ZERO,
                layout: Layout::Responsive,
                relayout_needed: false,
                unlayout_resets: true,
                render_outside: RenderOutsideViewport::Ratio(3.0),
                idle_render: RenderOutsideViewport::Bool(false),
                always_fixed: false,
                priority: LayoutPriority::Content,
                build_script: HookScript::Resolve,
                layout_script: HookScript::Resolve,
                manual_layout: None,
                calls: Calls::default(),
            }),
        })
    }

    pub fn built() -> Arc<Self> {
        let element = Self::new();
        element.state.lock().built = true;
        element
    }

    pub fn set_rect(&self, left: f64, top: f64, width: f64, height: f64) {
        self.state.lock().rect = layout_rect_ltwh(left, top, width, height);
    }

    pub fn set_upgraded(&self, upgraded: bool) {
        self.state.lock().upgraded = upgraded;
    }

    pub fn set_building(&self, building: bool) {
        self.state.lock().building = building;
    }

    pub fn set_layout(&self, layout: Layout) {
        self.state.lock().layout = layout;
    }

    pub fn set_relayout_needed(&self, needed: bool) {
        self.state.lock().relayout_needed = needed;
    }

    pub fn set_unlayout_resets(&self, resets: bool) {
        self.state.lock().unlayout_resets = resets;
    }

    pub fn set_render_outside(&self, hint: RenderOutsideViewport) {
        self.state.lock().render_outside = hint;
    }

    pub fn set_idle_render(&self, hint: RenderOutsideViewport) {
        self.state.lock().idle_render = hint;
    }

    pub fn set_always_fixed(&self, fixed: bool) {
        self.state.lock().always_fixed = fixed;
    }

    pub fn set_priority(&self, priority: LayoutPriority) {
        self.state.lock().priority = priority;
    }

    pub fn set_build_script(&self, script: HookScript) {
        self.state.lock().build_script = script;
    }

    pub fn set_layout_script(&self, script: HookScript) {
        self.state.lock().layout_script = script;
    }

    /// Settles a `HookScript::Manual` layout. Returns `false` if nothing
    /// was waiting.
    pub fn resolve_layout(&self, outcome: Result<(), ElementError>) -> bool {
        match self.state.lock().manual_layout.take() {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls.clone()
    }

    fn run(script: HookScript, manual: &mut Option<oneshot::Sender<Result<(), ElementError>>>) -> HookFuture {
        match script {
            HookScript::Resolve => async { Ok(()) }.boxed(),
            HookScript::Reject(reason) => async move { Err(ElementError::Failed(reason)) }.boxed(),
            HookScript::Manual => {
                let (sender, receiver) = oneshot::channel();
                *manual = Some(sender);
                async move {
                    receiver
                        .await
                        .unwrap_or_else(|_| Err(ElementError::Failed("dropped".to_string())))
                }
                .boxed()
            }
            HookScript::Panic => {
                let explode = true;
                async move {
                    if explode {
                        panic!("hook exploded");
                    }
                    Ok(())
                }
                .boxed()
            }
        }
    }
}

impl AmpElement for FakeElement {
    fn is_upgraded(&self) -> bool {
        self.state.lock().upgraded
    }

    fn is_built(&self) -> bool {
        self.state.lock().built
    }

    fn is_building(&self) -> bool {
        self.state.lock().building
    }

    fn build_internal(&self) -> HookFuture {
        let mut state = self.state.lock();
        state.calls.build += 1;
        let script = state.build_script.clone();
        if script == HookScript::Resolve {
            state.built = true;
        }
        let mut unused = None;
        Self::run(script, &mut unused)
    }

    fn bounding_client_rect(&self) -> LayoutRect {
        self.state.lock().rect
    }

    fn update_layout_box(&self, layout_box: LayoutRect, size_changed: bool) {
        self.state.lock().calls.layout_boxes.push((layout_box, size_changed));
    }

    fn is_relayout_needed(&self) -> bool {
        self.state.lock().relayout_needed
    }

    fn layout_callback(&self) -> HookFuture {
        let mut state = self.state.lock();
        state.calls.layout += 1;
        let script = state.layout_script.clone();
        Self::run(script, &mut state.manual_layout)
    }

    fn unlayout_callback(&self) -> bool {
        let mut state = self.state.lock();
        state.calls.unlayout += 1;
        state.unlayout_resets
    }

    fn apply_size(&self, height: Option<f64>, width: Option<f64>, margins: Option<Margins>) {
        self.state.lock().calls.apply_size.push((height, width, margins));
    }

    fn pause(&self) {
        self.state.lock().calls.pause += 1;
    }

    fn resume(&self) {
        self.state.lock().calls.resume += 1;
    }

    fn layout(&self) -> Layout {
        self.state.lock().layout
    }

    fn layout_priority(&self) -> LayoutPriority {
        self.state.lock().priority
    }

    fn render_outside_viewport(&self) -> RenderOutsideViewport {
        self.state.lock().render_outside
    }

    fn idle_render_outside_viewport(&self) -> RenderOutsideViewport {
        self.state.lock().idle_render
    }

    fn toggle_placeholder(&self, show: bool) {
        self.state.lock().calls.placeholder.push(show);
    }

    fn is_always_fixed(&self) -> bool {
        self.state.lock().always_fixed
    }

    fn collapsed_callback(&self, child: NodeId) {
        self.state.lock().calls.collapsed.push(child);
    }

    fn layout_scheduled(&self, time_ms: f64) {
        self.state.lock().calls.scheduled_at.push(time_ms);
    }
}

/// A document with a 100x100 viewport and a coordinator that records every
/// reported error.
pub struct Page {
    pub document: Arc<Document>,
    pub viewport: Arc<StaticViewport>,
    pub resources: Resources,
    errors: Arc<Mutex<Vec<(ResourceError, NodeId)>>>,
}

impl Page {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let document = Arc::new(Document::new());
        let viewport = Arc::new(StaticViewport::new(100.0, 100.0));
        let resources = Resources::new(
            Arc::clone(&document),
            Arc::clone(&viewport) as Arc<dyn Viewport>,
            config,
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        resources.set_error_handler(Some(move |err: &ResourceError, node: NodeId| {
            sink.lock().push((err.clone(), node));
        }));
        Self {
            document,
            viewport,
            resources,
            errors,
        }
    }

    /// A new element appended to the body.
    pub fn element(&self, tag: &str) -> NodeId {
        self.child(self.document.body(), tag)
    }

    pub fn child(&self, parent: NodeId, tag: &str) -> NodeId {
        let node = self.document.create_element(tag);
        self.document.append_child(parent, node).unwrap();
        node
    }

    pub fn manage(&self, node: NodeId, element: &Arc<FakeElement>) -> Arc<Resource> {
        self.resources.add(node, element.clone()).unwrap()
    }

    /// Appends a managed element to the body.
    pub fn add(&self, tag: &str, element: &Arc<FakeElement>) -> (NodeId, Arc<Resource>) {
        let node = self.element(tag);
        (node, self.manage(node, element))
    }

    pub fn errors(&self) -> Vec<(ResourceError, NodeId)> {
        self.errors.lock().clone()
    }
}

/// Measures, schedules and runs one layout.
pub async fn lay_out(resource: &Resource) -> Result<(), ResourceError> {
    resource.measure();
    resource.layout_scheduled(0.0);
    resource.start_layout()?.await
}
