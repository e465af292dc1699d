// src/filter.rs

//! Provider exclusion filter. Exact, case-sensitive names; no wildcards.

use crate::decoder::DecodedEvent;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct ProviderFilter {
    excluded: BTreeSet<String>,
}

impl ProviderFilter {
    pub fn new(excluded: BTreeSet<String>) -> Self {
        ProviderFilter { excluded }
    }

    /// `true` when the event's provider is not excluded.
    pub fn accept(&self, event: &DecodedEvent) -> bool {
        !self.excluded.contains(event.provider())
    }
}
