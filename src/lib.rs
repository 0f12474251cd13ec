//! Resource scheduler for custom-element documents.
//!
//! Every managed element is wrapped in a [`Resource`] that walks it through
//! build, measure and layout. The [`Resources`] coordinator owns all of a
//! document's resources and decides, pass by pass, which ones to lay out
//! based on viewport distance, scroll direction and priority. [`Owners`]
//! lets an element take over scheduling for its descendants.
//!
//! Element hooks are futures; run the coordinator on a Tokio runtime:
//! `#[tokio::main] async fn main() { /* resources.do_pass(now).await */ }`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod core;
pub mod element;
pub mod resources;
pub mod viewport;

pub use crate::core::{
    layout_rect_ltwh, Document, DocumentError, Layout, LayoutPriority, LayoutRect, Margins, NodeId,
    Position,
};
pub use crate::element::{AmpElement, ElementError, HookFuture, RenderOutsideViewport};
pub use crate::resources::{
    settled, DocumentContext, ErrorCallback, Owners, PassSummary, PassWork, Resource,
    ResourceError, ResourceFuture, ResourceState, Resources, ViewportChange, ViewportDistance,
};
pub use crate::viewport::{StaticViewport, Viewport};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("Element error: {0}")]
    Element(#[from] ElementError),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Tuning knobs for the coordinator. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on layouts started by one pass.
    pub max_layouts_per_pass: usize,
    /// Prefetch with the idle hint when a pass finds no visible work.
    pub idle_render_outside_viewport: bool,
    /// Remeasure everything when the viewport width changes.
    pub relayout_on_resize: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_layouts_per_pass: 8,
            idle_render_outside_viewport: true,
            relayout_on_resize: true,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SchedulerError::Config(e.to_string()))?;
        if config.max_layouts_per_pass == 0 {
            return Err(SchedulerError::Config(
                "max_layouts_per_pass must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
