//! Asset Version Ledger (§4.3).

mod error;
mod one_or_many;
mod scope;
mod store;

pub use error::LedgerError;
pub use one_or_many::OneOrMany;
pub use scope::Scope;
pub use store::{LedgerStore, NewAssetVersion};
