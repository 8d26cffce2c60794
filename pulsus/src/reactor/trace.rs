//! Call-site tracing for callbacks.
//!
//! When enabled, the driver remembers where every callback was created
//! and where it was first cancelled. The information only feeds
//! diagnostics: invalid-id errors and [`Driver::dump`](crate::Driver::dump).

use crate::reactor::CallbackId;

use std::collections::HashMap;
use std::panic::Location;

type Site = &'static Location<'static>;

#[derive(Default)]
pub(crate) struct Tracer {
    created: HashMap<CallbackId, Site>,
    cancelled: HashMap<CallbackId, Site>,
}

impl Tracer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn created(&mut self, id: CallbackId, site: Site) {
        log::trace!("callback {id} created at {site}");
        self.created.insert(id, site);
    }

    pub(crate) fn cancelled(&mut self, id: CallbackId, site: Site) {
        if self.created.contains_key(&id) && !self.cancelled.contains_key(&id) {
            log::trace!("callback {id} cancelled at {site}");
            self.cancelled.insert(id, site);
        }
    }

    pub(crate) fn creation_site(&self, id: CallbackId) -> Option<Site> {
        self.created.get(&id).copied()
    }

    /// Explains why `id` is not a live callback.
    pub(crate) fn explain_invalid(&self, id: CallbackId) -> String {
        match (self.created.get(&id), self.cancelled.get(&id)) {
            (Some(created), Some(cancelled)) => {
                format!("; created at {created}, cancelled at {cancelled}")
            }
            (Some(created), None) => format!("; created at {created}"),
            (None, _) => "; the identifier was never registered".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explains_cancelled_and_unknown_ids() {
        let mut tracer = Tracer::new();
        let id = CallbackId::from_raw(4);
        let created = Location::caller();
        tracer.created(id, created);

        let cancelled = Location::caller();
        tracer.cancelled(id, cancelled);
        tracer.cancelled(id, Location::caller());

        let explanation = tracer.explain_invalid(id);
        assert!(explanation.contains(&format!("created at {created}")));
        assert!(explanation.contains(&format!("cancelled at {cancelled}")));

        let unknown = tracer.explain_invalid(CallbackId::from_raw(99));
        assert!(unknown.contains("never registered"));
    }
}
