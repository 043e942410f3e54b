pub mod error;
pub mod types;
pub mod value;

pub use error::{DriverError, DriverErrorKind, DriverResult, PoolError, Result};
pub use types::{CallTarget, IdGenerator, IsolationLevel, PoolState};
pub use value::{ByteSource, CharSource, ParamValue};
