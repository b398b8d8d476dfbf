pub mod index;
pub mod watch;

pub use index::{BuildIndex, BuildManifest, IndexEntry, INDEX_FILENAME};
pub use watch::{BuildChange, BuildWatch};
