//! In-memory timeline document used by the host binary and by tests.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use log::info;
use tokio::sync::Notify;

use crate::protocol::Handle;
use crate::timeline::{handle_from_href, Discovery, RenderTarget};

/// One rendered author link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorLink {
    pub id: u64,
    pub href: String,
    pub text: String,
    /// Label recorded by the last write, if any.
    pub applied_label: Option<String>,
    pub write_count: u32,
}

/// Mutable stand-in for the rendered page.
#[derive(Debug, Default)]
pub struct TimelineDocument {
    links: RefCell<Vec<AuthorLink>>,
    next_id: Cell<u64>,
    changed: Rc<Notify>,
    echo_writes: bool,
}

impl TimelineDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every label write, used when the document mirrors a terminal session.
    pub fn with_echo(mut self) -> Self {
        self.echo_writes = true;
        self
    }

    /// Adds an author link and signals a change. Returns the element id.
    pub fn insert_link(&self, href: &str) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let text = handle_from_href(href).unwrap_or(href).to_string();
        self.links.borrow_mut().push(AuthorLink {
            id,
            href: href.to_string(),
            text,
            applied_label: None,
            write_count: 0,
        });
        self.changed.notify_one();
        id
    }

    /// Removes every link with `href` (scrolled out of view). Returns how many went.
    pub fn remove_links(&self, href: &str) -> usize {
        let mut links = self.links.borrow_mut();
        let before = links.len();
        links.retain(|link| link.href != href);
        let removed = before - links.len();
        if removed > 0 {
            self.changed.notify_one();
        }
        removed
    }

    #[cfg(test)]
    pub fn link(&self, id: u64) -> Option<AuthorLink> {
        self.links.borrow().iter().find(|link| link.id == id).cloned()
    }

    #[cfg(test)]
    pub fn links_for(&self, handle: &str) -> Vec<AuthorLink> {
        self.links
            .borrow()
            .iter()
            .filter(|link| handle_from_href(&link.href) == Some(handle))
            .cloned()
            .collect()
    }

    /// Total label writes across every element of `handle`.
    #[cfg(test)]
    pub fn write_count(&self, handle: &str) -> u32 {
        self.links_for(handle)
            .iter()
            .map(|link| link.write_count)
            .sum()
    }
}

/// A line typed into the host's feed: `+/alice` or `alice` adds, `-/alice` removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Add(String),
    Remove(String),
}

impl FeedCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (remove, target) = match line.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, line.strip_prefix('+').unwrap_or(line)),
        };
        let target = target.trim();
        let handle = target.strip_prefix('/').unwrap_or(target);
        if handle.is_empty() || handle.contains('/') || handle.contains(char::is_whitespace) {
            return None;
        }
        let href = format!("/{handle}");
        Some(if remove {
            Self::Remove(href)
        } else {
            Self::Add(href)
        })
    }

    pub fn apply(&self, document: &TimelineDocument) {
        match self {
            Self::Add(href) => {
                document.insert_link(href);
            }
            Self::Remove(href) => {
                document.remove_links(href);
            }
        }
    }
}

impl Discovery for TimelineDocument {
    fn discover(&self) -> HashSet<Handle> {
        self.links
            .borrow()
            .iter()
            .filter_map(|link| handle_from_href(&link.href))
            .map(str::to_string)
            .collect()
    }

    fn change_signal(&self) -> Option<Rc<Notify>> {
        Some(Rc::clone(&self.changed))
    }
}

impl RenderTarget for TimelineDocument {
    type Element = u64;

    fn elements_for(&self, handle: &str) -> Vec<u64> {
        self.links
            .borrow()
            .iter()
            .filter(|link| handle_from_href(&link.href) == Some(handle))
            .map(|link| link.id)
            .collect()
    }

    fn is_applied(&self, element: &u64, label: &str) -> bool {
        self.links
            .borrow()
            .iter()
            .any(|link| link.id == *element && link.applied_label.as_deref() == Some(label))
    }

    fn write_label(&self, element: &u64, handle: &str, label: &str) {
        let mut links = self.links.borrow_mut();
        if let Some(link) = links.iter_mut().find(|link| link.id == *element) {
            link.text = format!("{label} | {handle}");
            link.write_count = link.write_count.saturating_add(1);
            if self.echo_writes {
                info!("{}", link.text);
            }
        }
    }

    fn mark_applied(&self, element: &u64, label: &str) {
        let mut links = self.links.borrow_mut();
        if let Some(link) = links.iter_mut().find(|link| link.id == *element) {
            link.applied_label = Some(label.to_string());
        }
    }
}
