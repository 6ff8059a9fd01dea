mod db;
mod fwd;
mod mapping;

use thiserror::Error;

pub use db::{CacheEntry, LocalDb, MapCache};
pub use fwd::{FwdCache, FwdEntry};
pub use mapping::{
    EidKey, EidPrefix, Locator, LocatorState, Mapping, ProbingState, LOCATOR_PRIORITY_UNUSABLE,
};

pub use crate::msg::MapReplyAction;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("entry not found")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("invalid prefix")]
    InvalidPrefix,
}
