//! 内存盘：把块内容保存在内存中的块设备，未写过的块读出全零。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::BlockDevice;
use crate::consts::fs::BSIZE;
use crate::fs::BufData;

/// 以 `(dev, blockno)` 为键的内存块设备。
///
/// 同一个内存盘可以承载多个设备号。它会统计读写次数，
/// 并可以为每次读写附加固定延迟，模拟真实磁盘让出处理器的行为。
pub struct RamDisk {
    blocks: Mutex<HashMap<(u32, u32), Box<[u8; BSIZE]>>>,
    latency: Option<Duration>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            latency: None,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// 每次 `rw` 在完成前睡眠 `latency`。
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    /// 绕过缓存直接读取一块的内容。
    pub fn read_block(&self, dev: u32, blockno: u32) -> [u8; BSIZE] {
        match self.blocks.lock().get(&(dev, blockno)) {
            Some(block) => **block,
            None => [0; BSIZE],
        }
    }

    /// 绕过缓存直接写入一块，`bytes` 不足一块时其余字节置零。
    pub fn write_block(&self, dev: u32, blockno: u32, bytes: &[u8]) {
        assert!(bytes.len() <= BSIZE, "ramdisk: {} bytes do not fit a block", bytes.len());
        let mut block = Box::new([0; BSIZE]);
        block[..bytes.len()].copy_from_slice(bytes);
        self.blocks.lock().insert((dev, blockno), block);
    }

    /// 经由 `rw` 完成的读次数。
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// 经由 `rw` 完成的写次数。
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }

        let mut blocks = self.blocks.lock();
        if writing {
            blocks.insert((dev, blockno), Box::new(**data));
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            match blocks.get(&(dev, blockno)) {
                Some(block) => data.copy_from_slice(&block[..]),
                None => data.fill(0),
            }
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }
}
