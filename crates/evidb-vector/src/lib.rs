pub mod index;
pub mod metric;
pub mod persistence;

pub use index::{IndexEntry, IndexSnapshot, Lifecycle, VectorIndex};
pub use persistence::{Manifest, PersistenceManager, StagedSave};
