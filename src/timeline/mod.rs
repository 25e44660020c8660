//! Collaborator contracts for the rendered timeline, plus the in-memory document.

pub mod document;

use std::collections::HashSet;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::protocol::Handle;

/// Finds the author handles currently visible in the timeline.
pub trait Discovery {
    /// Cheap, synchronous scan of the visible view.
    fn discover(&self) -> HashSet<Handle>;

    /// Fired when the visual tree changes, if the host can observe that.
    fn change_signal(&self) -> Option<Rc<Notify>> {
        None
    }
}

/// Writes labels onto the live elements that represent a handle.
pub trait RenderTarget {
    type Element;

    /// Elements currently representing `handle`; empty when scrolled out of view.
    fn elements_for(&self, handle: &str) -> Vec<Self::Element>;
    fn is_applied(&self, element: &Self::Element, label: &str) -> bool;
    fn write_label(&self, element: &Self::Element, handle: &str, label: &str);
    fn mark_applied(&self, element: &Self::Element, label: &str);
}

/// Extracts the handle from an author link of the form `/handle`.
pub fn handle_from_href(href: &str) -> Option<&str> {
    let handle = href.strip_prefix('/')?;
    if handle.is_empty() || handle.contains('/') {
        return None;
    }
    Some(handle)
}

#[cfg(test)]
mod tests {
    use super::handle_from_href;

    #[test]
    fn test_handle_from_href_accepts_single_segment_links_only() {
        assert_eq!(handle_from_href("/alice"), Some("alice"));
        assert_eq!(handle_from_href("/alice/status/1"), None);
        assert_eq!(handle_from_href("alice"), None);
        assert_eq!(handle_from_href("/"), None);
    }
}
