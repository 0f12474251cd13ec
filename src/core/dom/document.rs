use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Declared CSS `position` of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Position {
    #[default]
    Static,
    Relative,
    Absolute,
    Fixed,
    Sticky,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub tag_name: String,
    pub attributes: HashMap<String, String>,
    pub parent: Option<NodeId>,
    pub children: SmallVec<[NodeId; 8]>,
    pub position: Position,
}

impl Node {
    pub fn new_element(tag_name: String, id: NodeId) -> Self {
        Self {
            id,
            tag_name: tag_name.to_ascii_lowercase(),
            attributes: HashMap::new(),
            parent: None,
            children: SmallVec::new(),
            position: Position::Static,
        }
    }

    pub fn get_tag_name(&self) -> &str {
        &self.tag_name
    }

    /// Custom elements are recognised by prefix so that stubs count before upgrade.
    pub fn is_amp_element(&self) -> bool {
        self.tag_name.starts_with("amp-")
    }
}

/// The managed document: an arena of element nodes keyed by [`NodeId`].
///
/// Only the tree queries the scheduler relies on are provided (ancestor and
/// descendant walks, containment, a handful of attributes and the declared
/// position). Nodes never point back at scheduler state; resources are looked
/// up by id.
pub struct Document {
    nodes: Arc<DashMap<NodeId, Arc<RwLock<Node>>>>,
    root_node: NodeId,
    body_node: NodeId,
    next_id: AtomicU64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("root_node", &self.root_node)
            .field("body_node", &self.body_node)
            .field("node_count", &self.nodes.len())
            .finish()
    }
}

impl Document {
    /// Creates `#document > html > body`.
    pub fn new() -> Self {
        let nodes = Arc::new(DashMap::new());
        let root_node = NodeId(0);
        let html_node = NodeId(1);
        let body_node = NodeId(2);

        let mut root = Node::new_element("#document".to_string(), root_node);
        root.children.push(html_node);
        let mut html = Node::new_element("html".to_string(), html_node);
        html.parent = Some(root_node);
        html.children.push(body_node);
        let mut body = Node::new_element("body".to_string(), body_node);
        body.parent = Some(html_node);

        nodes.insert(root_node, Arc::new(RwLock::new(root)));
        nodes.insert(html_node, Arc::new(RwLock::new(html)));
        nodes.insert(body_node, Arc::new(RwLock::new(body)));

        Self {
            nodes,
            root_node,
            body_node,
            next_id: AtomicU64::new(3),
        }
    }

    pub fn get_root_node(&self) -> NodeId {
        self.root_node
    }

    pub fn body(&self) -> NodeId {
        self.body_node
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_node(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Creates a detached element.
    pub fn create_element(&self, tag_name: &str) -> NodeId {
        let node_id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let node = Node::new_element(tag_name.to_string(), node_id);
        self.nodes.insert(node_id, Arc::new(RwLock::new(node)));
        node_id
    }

    /// Appends `child_id` to `parent_id`, detaching it from its previous parent.
    pub fn append_child(&self, parent_id: NodeId, child_id: NodeId) -> Result<()> {
        let parent_node = self.node(parent_id)?;
        let child_node = self.node(child_id)?;
        if self.contains(child_id, parent_id) {
            return Err(DocumentError::InvalidOperation(format!(
                "{child_id} is an ancestor of {parent_id}"
            )));
        }

        let previous_parent = child_node.read().parent;
        if let Some(previous) = previous_parent {
            if let Some(previous_node) = self.nodes.get(&previous) {
                previous_node.write().children.retain(|id| *id != child_id);
            }
        }

        parent_node.write().children.push(child_id);
        child_node.write().parent = Some(parent_id);
        Ok(())
    }

    pub fn remove_child(&self, parent_id: NodeId, child_id: NodeId) -> Result<()> {
        let parent_node = self.node(parent_id)?;
        let child_node = self.node(child_id)?;
        if child_node.read().parent != Some(parent_id) {
            return Err(DocumentError::InvalidOperation(format!(
                "{child_id} is not a child of {parent_id}"
            )));
        }
        parent_node.write().children.retain(|id| *id != child_id);
        child_node.write().parent = None;
        Ok(())
    }

    pub fn get_parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes.get(&node_id).and_then(|node| node.read().parent)
    }

    pub fn get_children(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node_id)
            .map(|node| node.read().children.to_vec())
            .unwrap_or_default()
    }

    pub fn get_tag_name(&self, node_id: NodeId) -> Option<String> {
        self.nodes
            .get(&node_id)
            .map(|node| node.read().tag_name.clone())
    }

    pub fn is_amp_element(&self, node_id: NodeId) -> bool {
        self.nodes
            .get(&node_id)
            .is_some_and(|node| node.read().is_amp_element())
    }

    pub fn set_attribute(&self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        let node = self.node(node_id)?;
        node.write()
            .attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_attribute(&self, node_id: NodeId, name: &str) -> Result<()> {
        let node = self.node(node_id)?;
        node.write().attributes.remove(name);
        Ok(())
    }

    pub fn get_attribute(&self, node_id: NodeId, name: &str) -> Option<String> {
        self.nodes
            .get(&node_id)
            .and_then(|node| node.read().attributes.get(name).cloned())
    }

    pub fn has_attribute(&self, node_id: NodeId, name: &str) -> bool {
        self.nodes
            .get(&node_id)
            .is_some_and(|node| node.read().attributes.contains_key(name))
    }

    /// Toggles the `hidden` attribute.
    pub fn set_hidden(&self, node_id: NodeId, hidden: bool) -> Result<()> {
        if hidden {
            self.set_attribute(node_id, "hidden", "")
        } else {
            self.remove_attribute(node_id, "hidden")
        }
    }

    pub fn is_hidden(&self, node_id: NodeId) -> bool {
        self.has_attribute(node_id, "hidden")
    }

    pub fn is_placeholder(&self, node_id: NodeId) -> bool {
        self.has_attribute(node_id, "placeholder")
    }

    pub fn set_position(&self, node_id: NodeId, position: Position) -> Result<()> {
        let node = self.node(node_id)?;
        node.write().position = position;
        Ok(())
    }

    pub fn get_position(&self, node_id: NodeId) -> Position {
        self.nodes
            .get(&node_id)
            .map(|node| node.read().position)
            .unwrap_or_default()
    }

    /// Inclusive containment, like `Node.contains`.
    pub fn contains(&self, ancestor: NodeId, node_id: NodeId) -> bool {
        let mut current = Some(node_id);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get_parent(id);
        }
        false
    }

    /// `node_id` followed by its ancestors, nearest first.
    pub fn ancestors(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.contains_node(node_id).then_some(node_id);
        while let Some(id) = current {
            chain.push(id);
            current = self.get_parent(id);
        }
        chain
    }

    /// The chain walked when deciding whether an element is fixed: the element
    /// and its ancestors, stopping before `body`.
    pub fn offset_chain(&self, node_id: NodeId) -> Vec<NodeId> {
        self.ancestors(node_id)
            .into_iter()
            .take_while(|id| *id != self.body_node)
            .collect()
    }

    /// Descendants of `node_id` in document order, excluding `node_id` itself.
    pub fn descendants(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.get_children(node_id).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            result.push(id);
            stack.extend(self.get_children(id).into_iter().rev());
        }
        result
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.contains(self.root_node, node_id)
    }

    fn node(&self, node_id: NodeId) -> Result<Arc<RwLock<Node>>> {
        self.nodes
            .get(&node_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(DocumentError::NodeNotFound(node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_skeleton() {
        let doc = Document::new();
        assert_eq!(doc.len(), 3);
        assert!(doc.is_connected(doc.body()));
        assert_eq!(doc.get_tag_name(doc.body()).as_deref(), Some("body"));
    }

    #[test]
    fn test_append_and_walk() {
        let doc = Document::new();
        let outer = doc.create_element("DIV");
        let inner = doc.create_element("amp-img");
        doc.append_child(doc.body(), outer).unwrap();
        doc.append_child(outer, inner).unwrap();

        assert_eq!(doc.get_tag_name(outer).as_deref(), Some("div"));
        assert!(doc.contains(outer, inner));
        assert!(doc.contains(inner, inner));
        assert!(!doc.contains(inner, outer));
        assert_eq!(doc.offset_chain(inner), vec![inner, outer]);
        assert_eq!(doc.descendants(doc.body()), vec![outer, inner]);
        assert!(doc.is_amp_element(inner));
    }

    #[test]
    fn test_reparent_and_cycles() {
        let doc = Document::new();
        let a = doc.create_element("div");
        let b = doc.create_element("div");
        doc.append_child(doc.body(), a).unwrap();
        doc.append_child(a, b).unwrap();

        assert!(doc.append_child(b, a).is_err());

        doc.append_child(doc.body(), b).unwrap();
        assert!(doc.get_children(a).is_empty());
        assert_eq!(doc.get_parent(b), Some(doc.body()));

        doc.remove_child(doc.body(), b).unwrap();
        assert!(!doc.is_connected(b));
        assert!(doc.remove_child(doc.body(), b).is_err());
    }

    #[test]
    fn test_hidden_attribute() {
        let doc = Document::new();
        let el = doc.create_element("amp-ad");
        doc.set_hidden(el, true).unwrap();
        assert!(doc.is_hidden(el));
        doc.set_hidden(el, false).unwrap();
        assert!(!doc.is_hidden(el));
        assert_eq!(
            doc.set_hidden(NodeId(999), true),
            Err(DocumentError::NodeNotFound(NodeId(999)))
        );
    }
}
