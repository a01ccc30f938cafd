//! Tuple and schema model for the distributed execution substrate.
//!
//! Tuples are ordered vectors of typed [`Value`]s conforming to a [`Schema`].
//! They are the unit of transport, queuing and result consumption.

pub mod error;
pub mod record;
pub mod schema;
pub mod types;
pub mod value;

pub use error::{QueryError, Result};
pub use record::tuples_to_record_batch;
pub use schema::{Field, Schema};
pub use types::*;
pub use value::{Tuple, Value};
