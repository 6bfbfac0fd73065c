pub mod definitions;
pub mod event_log;
pub mod state_store;

pub use definitions::{
    DefinitionRegistry, DefinitionStore, FilesystemDefinitionStore, StoredDefinition,
};
pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use state_store::{MemoryStateStore, RedbStateStore, StateStore};
