pub mod connection;
pub mod statement;

pub use connection::TwinConnection;
pub use statement::TwinStatement;
