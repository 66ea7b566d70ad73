//! 文件系统模块
//!
//! 这里只包含块缓存层；inode、日志等上层通过 `Bcache` 的共享引用访问磁盘块。

mod bio;

pub use bio::{Bcache, BcacheStats, Buf, BufData, BufState};
