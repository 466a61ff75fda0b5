//! Per-block event-transaction slot.

use crate::error::{FormError, Result};
use crate::model::RecordId;
use crate::triggers::EventKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventTransaction {
    pub event: EventKind,
    pub record: Option<RecordId>,
}

/// At most one unit of work per block. A second start fails closed and
/// leaves the running one untouched.
#[derive(Debug, Default)]
pub struct TransactionGuard {
    running: Option<EventTransaction>,
}

impl TransactionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_event_transaction(
        &mut self,
        event: EventKind,
        block: &str,
        record: Option<RecordId>,
    ) -> Result<()> {
        if let Some(running) = self.running {
            log::error!(
                "block '{block}': {event:?} collided with running {:?}",
                running.event
            );
            return Err(FormError::TransactionConflict {
                block: block.to_string(),
                running: running.event,
                attempted: event,
            });
        }
        self.running = Some(EventTransaction { event, record });
        Ok(())
    }

    pub fn end_event_transaction(&mut self, event: EventKind, block: &str) {
        if let Some(running) = self.running.take() {
            if running.event != event {
                log::debug!(
                    "block '{block}': {event:?} ended transaction started by {:?}",
                    running.event
                );
            }
        }
    }

    pub fn running(&self) -> Option<EventTransaction> {
        self.running
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Record reads during a running transaction are limited to the current
    /// record.
    pub fn check_offset(&self, block: &str, offset: i64) -> Result<()> {
        match self.running {
            Some(t) if offset != 0 => Err(FormError::TransactionRowAccess {
                block: block.to_string(),
                event: t.event,
                offset,
            }),
            _ => Ok(()),
        }
    }
}
