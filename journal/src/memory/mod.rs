// In-memory collaborators
// Volume, block cache and allocator backed by plain memory

mod allocator;
mod cache;
mod volume;

pub use allocator::MemoryAllocator;
pub use cache::MemoryCache;
pub use volume::{MemoryVolume, WriteRecord};
