//! nrsweep core: everything about a sweep that does not touch a process.
//!
//! - Parameter spaces with random sampling and filtered grid enumeration
//! - The `###RESULTS###` marker protocol spoken by the simulator
//! - Result layouts and their fixed-precision cell formatting
//! - The append-only raw result store
//! - Offline aggregation of the raw store into per-configuration means

pub mod aggregate;
pub mod layout;
pub mod param;
pub mod protocol;
pub mod store;

pub use aggregate::{AggregateConfig, AggregateError, AggregatedTable, Aggregator, Relabel, ScaleRule};
pub use layout::{FieldKind, ResultField, ResultLayout};
pub use param::{
    AssignmentFilter, LinkDirectionFilter, ParamError, ParamKind, ParamSpec, ParamValue,
    ParameterAssignment, ParameterSpace,
};
pub use protocol::{parse_results, ParseError};
pub use store::{ResultStore, StoreError};
