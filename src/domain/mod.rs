mod account;
mod dispute;
mod ledger;
mod money;
mod transaction;

pub use account::*;
pub use dispute::*;
pub use ledger::*;
pub use money::*;
pub use transaction::*;
