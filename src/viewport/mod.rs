//! Viewport service consumed by the scheduler.

use std::collections::HashSet;
use std::fmt;

use parking_lot::RwLock;

use crate::core::layout::{layout_rect_ltwh, LayoutRect};
use crate::core::NodeId;
use crate::element::AmpElement;

pub trait Viewport: Send + Sync {
    /// Visible area in document coordinates.
    fn rect(&self) -> LayoutRect;

    fn scroll_top(&self) -> f64;

    fn scroll_left(&self) -> f64 {
        0.0
    }

    /// The element's box in document coordinates.
    fn layout_rect(&self, element: &dyn AmpElement) -> LayoutRect {
        element
            .bounding_client_rect()
            .moved(self.scroll_left(), self.scroll_top())
    }

    fn is_declared_fixed(&self, node: NodeId) -> bool;

    fn supports_position_fixed(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct ViewportState {
    width: f64,
    height: f64,
    scroll_top: f64,
    scroll_left: f64,
    supports_position_fixed: bool,
}

/// In-memory viewport driven by the embedder (or by tests).
pub struct StaticViewport {
    state: RwLock<ViewportState>,
    declared_fixed: RwLock<HashSet<NodeId>>,
}

impl StaticViewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            state: RwLock::new(ViewportState {
                width,
                height,
                scroll_top: 0.0,
                scroll_left: 0.0,
                supports_position_fixed: true,
            }),
            declared_fixed: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_scroll_top(&self, scroll_top: f64) {
        self.state.write().scroll_top = scroll_top;
    }

    pub fn set_scroll_left(&self, scroll_left: f64) {
        self.state.write().scroll_left = scroll_left;
    }

    /// Returns `true` when the width changed.
    pub fn resize(&self, width: f64, height: f64) -> bool {
        let mut state = self.state.write();
        let width_changed = state.width != width;
        state.width = width;
        state.height = height;
        width_changed
    }

    pub fn set_supports_position_fixed(&self, supported: bool) {
        self.state.write().supports_position_fixed = supported;
    }

    pub fn declare_fixed(&self, node: NodeId) {
        self.declared_fixed.write().insert(node);
    }

    pub fn undeclare_fixed(&self, node: NodeId) {
        self.declared_fixed.write().remove(&node);
    }
}

impl fmt::Debug for StaticViewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticViewport")
            .field("state", &*self.state.read())
            .field("declared_fixed", &self.declared_fixed.read().len())
            .finish()
    }
}

impl Viewport for StaticViewport {
    fn rect(&self) -> LayoutRect {
        let state = self.state.read();
        layout_rect_ltwh(state.scroll_left, state.scroll_top, state.width, state.height)
    }

    fn scroll_top(&self) -> f64 {
        self.state.read().scroll_top
    }

    fn scroll_left(&self) -> f64 {
        self.state.read().scroll_left
    }

    fn is_declared_fixed(&self, node: NodeId) -> bool {
        self.declared_fixed.read().contains(&node)
    }

    fn supports_position_fixed(&self) -> bool {
        self.state.read().supports_position_fixed
    }
}
