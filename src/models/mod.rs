pub mod asset;
pub mod balance;
pub mod bucket;
pub mod chain;
pub mod token_record;
pub mod trace;

pub use asset::*;
pub use balance::*;
pub use bucket::*;
pub use chain::*;
pub use token_record::*;
pub use trace::*;
