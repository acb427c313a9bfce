pub mod manager;
pub mod types;

pub use manager::{PersistenceManager, RecoveredRecord};
pub use types::{DeadLetterEntry, PersistedEnvelope, PersistenceStats};
