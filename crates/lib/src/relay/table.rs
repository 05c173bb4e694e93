//! Correlation table: outstanding sent messages keyed by provider message id.
//!
//! A record is present exactly while its watch marker is (logically) attached to the remote
//! message. The table is owned by one control flow at a time, so it carries no lock.

use std::collections::HashMap;

use crate::relay::error::RelayError;

/// One relayed line awaiting responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub id: String,
    /// The text that was sent; never changes after registration.
    pub content: String,
    pub replies_collected: u32,
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    records: HashMap<String, OutboundRecord>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly sent message. Ids are provider-assigned, so a duplicate is a bug upstream.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), RelayError> {
        let id = id.into();
        if self.records.contains_key(&id) {
            return Err(RelayError::DuplicateId(id));
        }
        let record = OutboundRecord {
            id: id.clone(),
            content: content.into(),
            replies_collected: 0,
        };
        self.records.insert(id, record);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<&OutboundRecord> {
        self.records.get(id)
    }

    /// Count one more response for `id`; returns the new count, or None when not tracked.
    pub fn record_response(&mut self, id: &str) -> Option<u32> {
        let record = self.records.get_mut(id)?;
        record.replies_collected = record.replies_collected.saturating_add(1);
        Some(record.replies_collected)
    }

    /// Stop tracking `id`.
    pub fn resolve(&mut self, id: &str) -> Option<OutboundRecord> {
        self.records.remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and return every outstanding record.
    pub fn drain(&mut self) -> Vec<OutboundRecord> {
        self.records.drain().map(|(_, r)| r).collect()
    }
}
