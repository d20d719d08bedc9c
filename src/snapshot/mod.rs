pub mod catalog;
pub mod index;
pub mod writer;

pub use catalog::{DeletionReport, SnapshotCatalog};
pub use index::IndexMaintainer;
pub use writer::{CALCULATION_VERSION, SCHEMA_VERSION, SnapshotWriter, WriteOutcome, assemble_snapshot};
