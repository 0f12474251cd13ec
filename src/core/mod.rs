pub mod dom;
pub mod layout;

pub use dom::{Document, DocumentError, NodeId, Position};
pub use layout::{layout_rect_ltwh, Layout, LayoutPriority, LayoutRect, Margins};
