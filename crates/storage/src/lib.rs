pub mod error;
pub mod persist;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use persist::{FilePersistence, MemoryPersistence, SessionPersistence};
pub use store::MessageStore;
pub use types::{Anchor, DeliveryStatus, Message, MessagePatch, MessageRole};
