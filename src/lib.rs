//! xv6 风格的块缓冲区缓存。
//!
//! 文件系统对磁盘块的每一次访问都经过这一层：重复读取被合并，
//! 同一块的并发访问由每个缓冲块的睡眠锁串行化，写操作先落在内存中的缓冲块上，
//! 再由 `bwrite` 同步写回块设备。
//!
//! ```
//! use xv6_bcache::{Bcache, RamDisk};
//!
//! let cache = Bcache::new(RamDisk::new());
//! let mut b = cache.bread(1, 33);
//! b[0] = 0x7f;
//! b.bwrite();
//! cache.brelse(b);
//! assert_eq!(cache.disk().read_block(1, 33)[0], 0x7f);
//! ```

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
mod process;
mod sleeplock;
mod spinlock;

pub use driver::{BlockDevice, FileDisk, RamDisk};
pub use error::{DiskError, Result};
pub use fs::{Bcache, BcacheStats, Buf, BufData, BufState};
pub use spinlock::LockStats;
