// Application layer: the engines that own every ledger mutation, plus the
// seams to the owner directory and the notification channel.

pub mod accounts;
pub mod directory;
pub mod disputes;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod service;
mod unit;

pub use accounts::*;
pub use directory::*;
pub use disputes::*;
pub use error::*;
pub use ledger::*;
pub use notify::*;
pub use service::*;
