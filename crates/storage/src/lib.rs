mod buffer;
mod disk;
mod page;
mod replacer;

pub use buffer::{BufferPoolError, BufferPoolManager, BufferPoolResult, PageGuard};
pub use disk::{DiskManager, PageId, PAGE_SIZE};
pub use page::Page;
pub use replacer::{FrameId, LruReplacer, Replacer};
