//! 块设备打开阶段的错误类型。
//!
//! 缓存本身从不返回错误：锁纪律错误、缓冲块耗尽与设备读写失败都会直接 panic。
//! 只有在把磁盘镜像接入系统之前（打开、创建、校验大小）才有可恢复的错误。

use std::io;

use thiserror::Error;

use crate::consts::fs::BSIZE;

/// 块设备相关操作的返回类型。
pub type Result<T> = core::result::Result<T, DiskError>;

#[derive(Debug, Error)]
pub enum DiskError {
    /// 底层文件 I/O 失败。
    #[error("disk I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// 镜像长度不是块大小的整数倍。
    #[error("disk image size {len} is not a multiple of block size {}", BSIZE)]
    Misaligned { len: u64 },

    /// 镜像块数超出 `u32` 块号能寻址的范围。
    #[error("disk image has {blocks} blocks, more than a block number can address")]
    TooLarge { blocks: u64 },
}
