//! 块设备驱动
//!
//! 缓冲区缓存只通过 [`BlockDevice::rw`] 与磁盘打交道，
//! 驱动本身对缓存来说是不透明的同步 I/O 原语。

mod file_disk;
mod ramdisk;

pub use file_disk::FileDisk;
pub use ramdisk::RamDisk;

use crate::fs::BufData;

/// 同步块设备。
///
/// `rw` 把设备 `dev` 上第 `blockno` 块读入 `data`（`writing == false`），
/// 或把 `data` 写回该块（`writing == true`）。调用可能阻塞当前执行流，
/// 因此缓存保证调用时不持有任何哈希桶锁，只持有该缓冲块的睡眠锁。
///
/// 驱动无法完成请求时应当 panic：与内核驱动一样，块层没有可恢复的错误路径。
pub trait BlockDevice: Sync {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        (**self).rw(dev, blockno, data, writing)
    }
}

impl<D: BlockDevice + Send + ?Sized> BlockDevice for std::sync::Arc<D> {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        (**self).rw(dev, blockno, data, writing)
    }
}
