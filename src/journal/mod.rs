pub mod store;
pub mod types;

pub use store::{RollbackJournal, DEFAULT_CAPACITY};
pub use types::{EntryStatus, JournalEntry, ResourceState};
