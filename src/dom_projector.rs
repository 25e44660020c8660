//! Idempotent application of resolved labels onto the live timeline.

use std::rc::Rc;

use log::debug;

use crate::protocol::is_valid_label;
use crate::timeline::RenderTarget;

pub struct DomProjector<R: RenderTarget> {
    target: Rc<R>,
}

impl<R: RenderTarget> DomProjector<R> {
    pub fn new(target: Rc<R>) -> Self {
        Self { target }
    }

    /// Writes `label` onto every live element of `handle` that does not carry it yet.
    /// Returns the number of writes; zero when nothing is visible or all are current.
    pub fn project(&self, handle: &str, label: &str) -> usize {
        if !is_valid_label(label) {
            return 0;
        }
        let mut writes = 0;
        for element in self.target.elements_for(handle) {
            if self.target.is_applied(&element, label) {
                continue;
            }
            self.target.write_label(&element, handle, label);
            self.target.mark_applied(&element, label);
            writes += 1;
        }
        if writes > 0 {
            debug!("Enrichment[@{}]: projected '{}' onto {} element(s)", handle, label, writes);
        }
        writes
    }
}
