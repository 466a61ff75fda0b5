use serde::{Deserialize, Serialize};

/// Lifecycle of a record's working copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    New,
    Insert,
    Inserted,
    Update,
    Updated,
    Delete,
    Deleted,
    Consistent,
    QueryFilter,
}

impl RecordState {
    pub const ALL: [RecordState; 9] = [
        RecordState::New,
        RecordState::Insert,
        RecordState::Inserted,
        RecordState::Update,
        RecordState::Updated,
        RecordState::Delete,
        RecordState::Deleted,
        RecordState::Consistent,
        RecordState::QueryFilter,
    ];

    /// Never sent to the backend, so it can be dropped without a round-trip.
    pub fn is_local(self) -> bool {
        matches!(self, RecordState::New | RecordState::Insert)
    }

    /// Has an unflushed change that the backend has not seen yet.
    pub fn needs_flush(self) -> bool {
        matches!(
            self,
            RecordState::Insert | RecordState::Update | RecordState::Delete
        )
    }

    /// Flushed but not yet committed.
    pub fn is_flushed(self) -> bool {
        matches!(
            self,
            RecordState::Inserted | RecordState::Updated | RecordState::Deleted
        )
    }

    pub fn is_deleted(self) -> bool {
        matches!(self, RecordState::Delete | RecordState::Deleted)
    }

    /// State after a successful flush round-trip.
    pub fn flushed(self) -> RecordState {
        match self {
            RecordState::Insert => RecordState::Inserted,
            RecordState::Update => RecordState::Updated,
            RecordState::Delete => RecordState::Deleted,
            other => other,
        }
    }
}

/// Display status of a row slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Na,
    Qbe,
    New,
    Insert,
    Update,
    Delete,
}

impl From<RecordState> for Status {
    fn from(state: RecordState) -> Self {
        match state {
            RecordState::New | RecordState::Insert | RecordState::Inserted => Status::Insert,
            RecordState::Delete | RecordState::Deleted => Status::Delete,
            RecordState::Update | RecordState::Updated | RecordState::Consistent => {
                Status::Update
            }
            RecordState::QueryFilter => Status::Qbe,
        }
    }
}

impl Status {
    /// Status of a slot bound to `state`, or `Na` when unbound.
    pub fn of(state: Option<RecordState>) -> Status {
        state.map(Status::from).unwrap_or(Status::Na)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Na => "na",
            Status::Qbe => "qbe",
            Status::New => "new",
            Status::Insert => "insert",
            Status::Update => "update",
            Status::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_maps_to_one_status() {
        for state in RecordState::ALL {
            let status = Status::from(state);
            assert_ne!(status, Status::Na, "{state:?} must map to a bound status");
            assert_ne!(status, Status::New, "{state:?} never maps to the transient new status");
        }
    }

    #[test]
    fn conversion_table() {
        assert_eq!(Status::from(RecordState::New), Status::Insert);
        assert_eq!(Status::from(RecordState::Inserted), Status::Insert);
        assert_eq!(Status::from(RecordState::Deleted), Status::Delete);
        assert_eq!(Status::from(RecordState::Consistent), Status::Update);
        assert_eq!(Status::from(RecordState::Updated), Status::Update);
        assert_eq!(Status::from(RecordState::QueryFilter), Status::Qbe);
        assert_eq!(Status::of(None), Status::Na);
    }

    #[test]
    fn flushed_transitions() {
        assert_eq!(RecordState::Insert.flushed(), RecordState::Inserted);
        assert_eq!(RecordState::Update.flushed(), RecordState::Updated);
        assert_eq!(RecordState::Delete.flushed(), RecordState::Deleted);
        assert_eq!(RecordState::Consistent.flushed(), RecordState::Consistent);
        assert!(RecordState::New.is_local());
        assert!(!RecordState::Inserted.is_local());
    }
}
