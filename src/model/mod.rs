//! Field/row/record state machine.

pub mod field;
pub mod record;
pub mod row;
pub mod status;

pub use field::{
    DataType, Field, FieldDef, FieldInstance, FieldKind, FieldProperties, SelectOption, StatusProperties,
};
pub use record::{Record, RecordId, RecordSet, Values};
pub use row::{Row, MIRROR_ROW};
pub use status::{RecordState, Status};
