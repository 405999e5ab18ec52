pub mod checkpoint;
pub mod connection;
pub mod record_store;

pub use checkpoint::*;
pub use connection::*;
pub use record_store::*;
