pub mod cloud;
pub mod local;
pub mod memory;
pub mod provider;

pub use cloud::CloudStorageProvider;
pub use local::LocalStorageProvider;
pub use memory::MemoryStorageProvider;
pub use provider::{PutOutcome, StorageProvider};
