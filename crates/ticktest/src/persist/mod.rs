mod atomic_io;
mod resume;
mod snapshot;
mod store;

pub(crate) use resume::{prepare_reload, resume_after_reload};
pub use resume::{ResumeError, ResumeMismatch};
pub use snapshot::{structure_fingerprint, BlockSnapshot, NodeSnapshot, ResumeSnapshot, TestSnapshot};
pub use store::{FileStore, MemoryStore, PersistedStage, PersistentStore, StoreError};
