use std::fmt;
use std::sync::Arc;

use futures::future;
use tracing::{debug, trace};

use super::context::DocumentContext;
use super::resource::Resource;
use super::{ResourceError, ResourceFuture, ResourceState, Result};
use crate::core::NodeId;

/// Owner-side control over delegated descendants. Owned resources are never
/// scheduled by the coordinator's viewport heuristic; their owner drives
/// them through this registry instead.
#[derive(Clone)]
pub struct Owners {
    context: Arc<DocumentContext>,
}

impl Owners {
    pub(crate) fn new(context: Arc<DocumentContext>) -> Self {
        Self { context }
    }

    /// Delegates `element` to `owner`, which must contain it. Descendant
    /// resources look their owner up again on next use.
    pub fn set_owner(&self, element: NodeId, owner: NodeId) -> Result<()> {
        let document = self.context.document();
        if !document.contains(owner, element) {
            return Err(ResourceError::OwnerNotAncestor { element, owner });
        }
        self.context.register_owner(element, owner);
        if let Some(resource) = self.context.resource(element) {
            resource.update_owner(Some(owner));
        }
        for descendant in document.descendants(element) {
            if let Some(resource) = self.context.resource(descendant) {
                resource.update_owner(None);
            }
        }
        debug!(%element, %owner, "owner set");
        Ok(())
    }

    /// Lays out the managed resources among `children` of `parent`.
    pub fn schedule_layout(&self, parent: NodeId, children: &[NodeId]) -> Result<Vec<ResourceFuture>> {
        let resources = self.owned_resources(parent, children)?;
        let mut layouts = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.layout_owned(&resource) {
                Ok(Some(layout)) => layouts.push(layout),
                Ok(None) => {}
                Err(err) => self.context.report_error(&err, resource.node_id()),
            }
        }
        Ok(layouts)
    }

    pub fn schedule_pause(&self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        for resource in self.owned_resources(parent, children)? {
            resource.pause();
        }
        Ok(())
    }

    pub fn schedule_resume(&self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        for resource in self.owned_resources(parent, children)? {
            resource.resume();
        }
        Ok(())
    }

    pub fn schedule_unlayout(&self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        for resource in self.owned_resources(parent, children)? {
            resource.unlayout();
        }
        Ok(())
    }

    /// Builds, measures and lays out every managed resource at or under
    /// `element`, settling with the first failure.
    pub async fn require_layout(&self, element: NodeId) -> Result<()> {
        let resources = self.discover(&[element]);
        let mut layouts = Vec::with_capacity(resources.len());
        for resource in resources {
            if !resource.is_built() {
                if let Some(build) = resource.build() {
                    build.await?;
                }
            }
            if let Some(layout) = self.layout_owned(&resource)? {
                layouts.push(layout);
            }
        }
        for outcome in future::join_all(layouts).await {
            outcome?;
        }
        Ok(())
    }

    fn layout_owned(&self, resource: &Arc<Resource>) -> Result<Option<ResourceFuture>> {
        if !resource.is_built() {
            trace!(resource = %resource.debug_id(), "owned resource not built yet");
            return Ok(None);
        }
        if !resource.has_been_measured() || resource.is_measure_requested() {
            resource.measure();
        }
        match resource.state() {
            ResourceState::ReadyForLayout => {
                if !resource.is_displayed() {
                    return Ok(None);
                }
                resource.layout_scheduled(self.context.now_ms());
                resource.start_layout().map(Some)
            }
            ResourceState::LayoutScheduled
            | ResourceState::LayoutComplete
            | ResourceState::LayoutFailed => resource.start_layout().map(Some),
            _ => Ok(None),
        }
    }

    fn owned_resources(&self, parent: NodeId, children: &[NodeId]) -> Result<Vec<Arc<Resource>>> {
        if self.context.resource(parent).is_none() {
            return Err(ResourceError::UnknownElement(parent));
        }
        let document = self.context.document();
        if let Some(stray) = children.iter().find(|child| !document.contains(parent, **child)) {
            return Err(ResourceError::OwnerNotAncestor {
                element: *stray,
                owner: parent,
            });
        }
        Ok(self.discover(children))
    }

    /// Managed resources for `elements`: a managed element stands for
    /// itself and its managed placeholder children, anything else for its
    /// topmost managed descendants.
    fn discover(&self, elements: &[NodeId]) -> Vec<Arc<Resource>> {
        let mut found = Vec::new();
        for element in elements {
            self.discover_element(*element, &mut found);
        }
        found
    }

    fn discover_element(&self, element: NodeId, found: &mut Vec<Arc<Resource>>) {
        let document = self.context.document();
        if let Some(resource) = self.context.resource(element) {
            found.push(resource);
            for child in document.get_children(element) {
                if document.is_placeholder(child) {
                    if let Some(placeholder) = self.context.resource(child) {
                        found.push(placeholder);
                    }
                }
            }
            return;
        }
        for child in document.get_children(element) {
            self.discover_element(child, found);
        }
    }
}

impl fmt::Debug for Owners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owners").finish_non_exhaustive()
    }
}
