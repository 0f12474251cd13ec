pub mod document;

pub use document::{Document, DocumentError, Node, NodeId, Position};
