pub mod record;
pub mod store;

pub use record::{Record, RecordedCall};
