// Storage: opaque blob, record and queue backends the pipeline consumes.

pub mod fs;
pub mod memory;
pub mod traits;

pub use fs::{FsBlobStore, FsRecordStore};
pub use memory::{MemoryBlobStore, MemoryJobQueue, MemoryRecordStore};
pub use traits::{BlobStore, JobQueue, RecordStore, StageJob};
