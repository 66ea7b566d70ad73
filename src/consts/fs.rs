//! 文件系统与缓冲区缓存的常量。
//!
//! 缓存的全部配置都在编译期确定，运行期间既不扩容也不重新哈希。

/// 单次文件系统操作最多写入的块数。
pub const MAXOPBLOCKS: usize = 10;

/// 磁盘块大小（字节）。
pub const BSIZE: usize = 1024;

/// 缓冲区缓存中缓冲块的数量。
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// 缓冲区缓存的哈希桶数量。取素数，使连续块号均匀分散。
pub const NBUCKET: usize = 13;
