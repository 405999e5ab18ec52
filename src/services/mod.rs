pub mod balance_aggregator;
pub mod blockchain_service;
pub mod bucketed_writer;
pub mod pipeline_runner;
pub mod price_table;
pub mod trace_flattener;
pub mod transfer_scanner;

pub use balance_aggregator::*;
pub use blockchain_service::*;
pub use bucketed_writer::*;
pub use pipeline_runner::*;
pub use price_table::*;
pub use trace_flattener::*;
pub use transfer_scanner::*;
