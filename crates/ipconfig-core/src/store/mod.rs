// # Store Implementations
//
// Implementations of the `Publisher` + `ConfigSource` pair for different
// persistence strategies.

pub mod file;
pub mod memory;

pub use file::{FileStore, FileStoreFactory};
pub use memory::{MemoryStore, MemoryStoreFactory};
