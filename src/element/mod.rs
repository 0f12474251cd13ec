//! The capability set a managed element exposes to the scheduler.

use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::core::layout::{Layout, LayoutPriority, LayoutRect, Margins};
use crate::core::NodeId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElementError {
    #[error("{0}")]
    Failed(String),
    #[error("hook panicked: {0}")]
    Panicked(String),
}

/// Future returned by the asynchronous element hooks. Implementations clone
/// whatever state they need into the future so it can outlive the call.
pub type HookFuture = BoxFuture<'static, Result<(), ElementError>>;

/// An element's prefetch hint: a plain yes/no, or a margin expressed in
/// viewport heights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOutsideViewport {
    Bool(bool),
    Ratio(f64),
}

impl RenderOutsideViewport {
    /// Stable map key: `"true"`, `"false"`, or the shortest decimal form of the ratio.
    pub fn key(&self) -> String {
        match self {
            Self::Bool(flag) => flag.to_string(),
            Self::Ratio(ratio) => ratio.to_string(),
        }
    }
}

impl fmt::Display for RenderOutsideViewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<bool> for RenderOutsideViewport {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<f64> for RenderOutsideViewport {
    fn from(ratio: f64) -> Self {
        Self::Ratio(ratio)
    }
}

/// Hooks implemented by every concrete element variant. The scheduler only
/// ever talks to elements through this trait.
///
/// Synchronous hooks must not call back into the owning `Resource`.
pub trait AmpElement: Send + Sync {
    fn is_upgraded(&self) -> bool;

    fn is_built(&self) -> bool;

    fn is_building(&self) -> bool {
        false
    }

    fn build_internal(&self) -> HookFuture;

    /// Box relative to the current scroll position.
    fn bounding_client_rect(&self) -> LayoutRect;

    fn update_layout_box(&self, _layout_box: LayoutRect, _size_changed: bool) {}

    fn is_relayout_needed(&self) -> bool {
        false
    }

    fn layout_callback(&self) -> HookFuture;

    /// Returns `true` when the element has released its content and must be
    /// laid out again.
    fn unlayout_callback(&self) -> bool {
        true
    }

    fn apply_size(&self, _height: Option<f64>, _width: Option<f64>, _margins: Option<Margins>) {}

    fn pause(&self) {}

    fn resume(&self) {}

    fn layout(&self) -> Layout {
        Layout::Responsive
    }

    fn layout_priority(&self) -> LayoutPriority {
        LayoutPriority::Content
    }

    fn render_outside_viewport(&self) -> RenderOutsideViewport {
        RenderOutsideViewport::Ratio(3.0)
    }

    fn idle_render_outside_viewport(&self) -> RenderOutsideViewport {
        RenderOutsideViewport::Bool(false)
    }

    fn toggle_placeholder(&self, _show: bool) {}

    fn is_always_fixed(&self) -> bool {
        false
    }

    /// Called on an owner when one of its owned elements collapses.
    fn collapsed_callback(&self, _child: NodeId) {}

    fn layout_scheduled(&self, _time_ms: f64) {}
}

/// Runs a hook future, turning a panic inside it into an [`ElementError`].
pub(crate) fn guarded(hook: HookFuture) -> HookFuture {
    AssertUnwindSafe(hook)
        .catch_unwind()
        .map(|outcome| match outcome {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(ElementError::Panicked(msg))
            }
        })
        .boxed()
}
