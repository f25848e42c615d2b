//! 结果缓存：键值存储抽象、LRU 内存实现、文件实现、内容寻址的缓存管理器

pub mod file;
pub mod manager;
pub mod store;

pub use file::FileKvStore;
pub use manager::{CacheEntry, CacheManager, CacheStats};
pub use store::{CacheError, InMemoryKvStore, KvStore};
