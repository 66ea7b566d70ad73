//! 缓存层
//!
//! 缓冲区缓存保存固定数量的磁盘块副本。把块缓存在内存里可以减少磁盘读取，
//! 同时为多个执行流共同使用的块提供一个同步点。
//!
//! 接口：
//! - 要获得某个磁盘块的缓冲块，调用 `bread`。
//! - 修改缓冲块数据之后，调用 `bwrite` 写回磁盘。
//! - 用完缓冲块，调用 `brelse`（或直接丢弃 `Buf`）。
//! - 同一时刻只有一个执行流能使用一个缓冲块，因此不要持有过久。
//!
//! 缓冲块按块号哈希到 `NBUCKET` 个桶中，每个桶有自己的自旋锁，
//! 不存在全局锁。桶内找不到可用的缓冲块时，从其他桶“偷”一个最久未用的过来。

use array_macro::array;
use arrayvec::ArrayVec;

use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{LockStats, SpinLock, SpinLockGuard};

/// 块号到桶编号的映射，缓存生命周期内固定不变。
#[inline]
fn hash(blockno: u32) -> usize {
    blockno as usize % NBUCKET
}

/// 缓冲区缓存（Buffer Cache），位于文件系统与块设备驱动之间。
///
/// `Bcache` 持有 `NBUF` 个固定的缓冲块槽位与 `NBUCKET` 个哈希桶。
/// 槽位的存储从不移动，也从不释放；在桶之间流动的只是槽位的控制信息
/// （`BufCtrl`：设备号、块号、引用计数、时间戳）。
///
/// 锁的分工：
/// - 桶的自旋锁保护桶内链表以及其中每个 `BufCtrl`；
/// - 槽位的睡眠锁保护块数据，磁盘 I/O 期间一直持有。
///
/// 该结构在系统启动时创建一次，以共享引用的方式交给文件系统层使用。
pub struct Bcache<D> {
    buckets: [SpinLock<Bucket>; NBUCKET],
    bufs: [BufInner; NBUF],

    /// 逻辑时钟，每盖一次时间戳前进一格。
    ticks: AtomicU64,
    counters: Counters,
    disk: D,
}

impl<D: BlockDevice> Bcache<D> {
    /// 创建缓冲区缓存。
    ///
    /// # 功能说明
    /// 所有槽位在启动时块号都为 0，按照哈希规则全部挂入 `hash(0)` 号桶，
    /// 时间戳为 0。之后的 `bread` 通过跨桶回收逐渐把缓冲块分散到各个桶中。
    pub fn new(disk: D) -> Self {
        let cache = Self {
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache.bucket"); NBUCKET],
            bufs: array![_ => BufInner::new(); NBUF],
            ticks: AtomicU64::new(0),
            counters: Counters::new(),
            disk,
        };

        {
            let mut boot = cache.buckets[hash(0)].lock();
            for index in 0..NBUF {
                boot.push_front(BufCtrl::new(index));
            }
        }

        info!("bcache: {} buffers in {} buckets", NBUF, NBUCKET);
        #[cfg(feature = "verbose_init_info")]
        info!("bcache: block size {}, all buffers start in bucket {}", BSIZE, hash(0));

        cache
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 调用 `bget` 获取目标块的缓冲块（持有其睡眠锁）。
    /// 若缓冲块尚未从磁盘加载（`valid == false`），在持有睡眠锁、
    /// 不持有任何桶锁的情况下同步读盘，然后标记为有效。
    ///
    /// # 返回值
    /// - 独占持有的 `Buf`，丢弃或交给 `brelse` 即释放。
    ///
    /// # 可能的错误
    /// - 所有缓冲块都被引用时 panic（`"bget: no buffers"`）；
    /// - 驱动读盘失败时由驱动 panic。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.rw(dev, blockno, &mut *b, false);
            self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 释放缓冲块，等同于丢弃 `b`。
    ///
    /// # 可能的错误
    /// - `b` 属于另一个缓存时 panic。
    pub fn brelse(&self, b: Buf<'_, D>) {
        if !ptr::eq(b.cache, self) {
            panic!("brelse: buffer {} belongs to another cache", b.index);
        }
        drop(b);
    }

    /// 查找 `(dev, blockno)` 对应的缓冲块，必要时回收一个，
    /// 返回持有睡眠锁的 `Buf`。
    ///
    /// # 流程解释
    /// 1. 锁住本桶 `h = hash(blockno)`；
    /// 2. 本桶命中：引用计数加一；
    /// 3. 本桶内有引用计数为 0、块号恰好相同（设备号不同）的旧缓冲块：
    ///    取时间戳最小的一个，改设备号并置为无效；
    /// 4. 否则从 `h + 1` 开始环形扫描其他桶，在第一个有空闲缓冲块的桶里
    ///    取时间戳最小的那个，把它从原桶摘下、挂到本桶头部并重新初始化；
    /// 5. 其他桶都没有空闲缓冲块时，回收本桶中时间戳最小的空闲缓冲块；
    /// 6. 所有缓冲块都被引用时 panic。
    ///
    /// 无论哪条路径，都先放开所有桶锁，再去获取缓冲块的睡眠锁。
    ///
    /// # 加锁顺序
    /// 同时持有两个桶锁时一律按桶编号升序获取。候选桶 `i > h` 时直接在
    /// 持有本桶的情况下锁 `i`；`i < h` 时先放开本桶，锁 `i` 再重新锁本桶，
    /// 由于本桶短暂放开过，需要重新做第 2、3 步，避免同一个块出现两份副本。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let h = hash(blockno);
        let mut home = self.buckets[h].lock();

        if let Some(index) = self.lookup(&mut home, dev, blockno) {
            drop(home);
            return self.lock_buf(index, dev, blockno);
        }

        let mut i = (h + 1) % NBUCKET;
        while i != h {
            let mut victim = if i < h {
                drop(home);
                let victim = self.buckets[i].lock();
                home = self.buckets[h].lock();
                if let Some(index) = self.lookup(&mut home, dev, blockno) {
                    drop(victim);
                    drop(home);
                    return self.lock_buf(index, dev, blockno);
                }
                victim
            } else {
                self.buckets[i].lock()
            };

            if let Some(b) = victim.take_lru() {
                drop(victim);
                debug!("bcache: steal buffer {} from bucket {} for ({}, {}) in bucket {}",
                    b.index, i, dev, blockno, h);
                self.counters.steals.fetch_add(1, Ordering::Relaxed);

                let index = self.install(&mut home, b, dev, blockno);
                drop(home);
                return self.lock_buf(index, dev, blockno);
            }
            drop(victim);
            i = (i + 1) % NBUCKET;
        }

        // 其他桶都没有空闲缓冲块，回收本桶自己最久未用的那个
        if let Some(b) = home.take_lru() {
            debug!("bcache: recycle buffer {} within bucket {} for ({}, {})",
                b.index, h, dev, blockno);
            let index = self.install(&mut home, b, dev, blockno);
            drop(home);
            return self.lock_buf(index, dev, blockno);
        }

        panic!("bget: no buffers");
    }
}

impl<D> Bcache<D> {
    /// 在已锁住的本桶内完成 `bget` 的第 2、3 步。
    fn lookup(&self, home: &mut SpinLockGuard<'_, Bucket>, dev: u32, blockno: u32) -> Option<usize> {
        if let Some(index) = home.find_cached(dev, blockno) {
            trace!("bcache: hit ({}, {}) in buffer {}", dev, blockno, index);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(index);
        }

        let index = home.reuse_stale(dev, blockno)?;
        trace!("bcache: miss ({}, {}), reuse buffer {} in place", dev, blockno, index);
        self.bufs[index].valid.store(false, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Some(index)
    }

    /// 把摘下的空闲缓冲块改绑为 `(dev, blockno)` 并挂到本桶头部。
    fn install(&self, home: &mut SpinLockGuard<'_, Bucket>, mut b: BufCtrl, dev: u32, blockno: u32) -> usize {
        b.timestamp = self.tick();
        b.dev = dev;
        b.blockno = blockno;
        b.refcnt = 1;
        let index = b.index;
        home.push_front(b);
        self.bufs[index].valid.store(false, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!("bcache: miss ({}, {}) into buffer {}", dev, blockno, index);
        index
    }

    /// 获取槽位的睡眠锁，调用时不得持有任何桶锁。
    fn lock_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// `brelse` 的桶侧部分：睡眠锁已经释放，引用计数减一，
    /// 归零时盖上时间戳，表示该缓冲块从此刻起空闲。
    fn release(&self, index: usize, blockno: u32) {
        let h = hash(blockno);
        let mut bucket = self.buckets[h].lock();
        let b = bucket.ctrl_mut(index, "brelse");
        if b.refcnt == 0 {
            panic!("brelse: buffer {} not referenced", index);
        }
        b.refcnt -= 1;
        if b.refcnt == 0 {
            b.timestamp = self.tick();
            trace!("bcache: buffer {} ({}, {}) idle at {}", index, b.dev, blockno, b.timestamp);
        }
    }

    fn pin(&self, index: usize, blockno: u32) {
        let mut bucket = self.buckets[hash(blockno)].lock();
        bucket.ctrl_mut(index, "bpin").refcnt += 1;
    }

    fn unpin(&self, index: usize, blockno: u32) {
        let mut bucket = self.buckets[hash(blockno)].lock();
        let b = bucket.ctrl_mut(index, "bunpin");
        // 调用者自己持有的那一份引用不能被 unpin 掉
        if b.refcnt <= 1 {
            panic!("bunpin: count not match");
        }
        b.refcnt -= 1;
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 底层块设备。
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 读取命中、回收、读写盘计数以及每个桶锁的竞争统计。
    pub fn stats(&self) -> BcacheStats {
        BcacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
            buckets: self.buckets.iter().map(|b| b.stats()).collect(),
        }
    }

    /// 所有缓冲块控制信息的一致快照，按桶编号、桶内顺序排列。
    ///
    /// 按升序一次锁住全部桶，快照期间缓存暂停工作，只用于调试与测试。
    pub fn snapshot(&self) -> Vec<BufState> {
        let guards: Vec<_> = self.buckets.iter().map(|b| b.lock()).collect();
        guards
            .iter()
            .enumerate()
            .flat_map(|(bucket, guard)| {
                guard.list.iter().map(move |b| BufState {
                    bucket,
                    index: b.index,
                    dev: b.dev,
                    blockno: b.blockno,
                    refcnt: b.refcnt,
                    timestamp: b.timestamp,
                })
            })
            .collect()
    }
}

/// 缓冲块句柄，表示一个已分配的磁盘块缓存实体。
///
/// `Buf` 持有槽位数据的睡眠锁，在生命周期内独占访问块数据；
/// 丢弃时先放开睡眠锁，再到所属桶里把引用计数减一。
/// 句柄不能跨线程移动，睡眠锁记录的持有者就是创建它的执行流。
pub struct Buf<'a, D> {
    cache: &'a Bcache<D>,

    /// 槽位在缓冲数组中的索引。
    index: usize,
    dev: u32,
    blockno: u32,

    /// 在 `Buf` 生命周期内始终为 `Some`，`Drop` 中先取出以便先释放睡眠锁。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D> Buf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 槽位编号，同一个槽位可能先后缓存不同的块。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 将引用计数加一，“钉住”该块，使其在释放后也不会被回收。
    ///
    /// 只触碰桶锁，不涉及睡眠锁；日志层用它让块留在缓存中直到提交。
    pub fn pin(&self) {
        self.cache.pin(self.index, self.blockno);
    }

    /// 与 `pin` 配对，撤销一次钉住。
    ///
    /// # 可能的错误
    /// - 没有对应的 `pin` 时 panic（`"bunpin: count not match"`）。
    pub fn unpin(&self) {
        self.cache.unpin(self.index, self.blockno);
    }

    fn data(&self) -> &BufData {
        match self.data.as_ref() {
            Some(guard) => &**guard,
            None => panic!("buf {}: used after release", self.index),
        }
    }
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    /// 把缓冲块内容写回磁盘，要求持有该缓冲块的睡眠锁。
    ///
    /// 不改变有效位与引用计数。
    pub fn bwrite(&mut self) {
        let cache = self.cache;
        if !cache.bufs[self.index].data.holding() {
            panic!("bwrite");
        }
        let (dev, blockno) = (self.dev, self.blockno);
        cache.disk.rw(dev, blockno, &mut **self, true);
        cache.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
    }
}

impl<'a, D> Deref for Buf<'a, D> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data()
    }
}

impl<'a, D> DerefMut for Buf<'a, D> {
    fn deref_mut(&mut self) -> &mut BufData {
        let index = self.index;
        match self.data.as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("buf {}: used after release", index),
        }
    }
}

impl<'a, D> Drop for Buf<'a, D> {
    fn drop(&mut self) {
        if !self.cache.bufs[self.index].data.holding() {
            panic!("brelse");
        }
        drop(self.data.take());
        self.cache.release(self.index, self.blockno);
    }
}

/// 一个哈希桶：当前归属于它的缓冲块控制信息，按链表顺序（头部在前）排列。
struct Bucket {
    list: ArrayVec<BufCtrl, NBUF>,
}

impl Bucket {
    const fn new() -> Self {
        Self { list: ArrayVec::new_const() }
    }

    /// 查找 `(dev, blockno)`，命中则引用计数加一。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let b = self.list.iter_mut().find(|b| b.dev == dev && b.blockno == blockno)?;
        b.refcnt += 1;
        Some(b.index)
    }

    /// 在空闲且块号相同的缓冲块中取时间戳最小的一个，改绑到 `dev`。
    fn reuse_stale(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let b = self
            .list
            .iter_mut()
            .filter(|b| b.refcnt == 0 && b.blockno == blockno)
            .min_by_key(|b| b.timestamp)?;
        b.dev = dev;
        b.refcnt = 1;
        Some(b.index)
    }

    /// 摘下本桶中时间戳最小的空闲缓冲块，其余成员保持原有顺序。
    fn take_lru(&mut self) -> Option<BufCtrl> {
        let pos = self
            .list
            .iter()
            .enumerate()
            .filter(|(_, b)| b.refcnt == 0)
            .min_by_key(|(_, b)| b.timestamp)
            .map(|(pos, _)| pos)?;
        Some(self.list.remove(pos))
    }

    fn push_front(&mut self, b: BufCtrl) {
        self.list.insert(0, b);
    }

    /// 引用计数大于 0 的缓冲块一定位于 `hash(blockno)` 号桶中。
    fn ctrl_mut(&mut self, index: usize, op: &str) -> &mut BufCtrl {
        match self.list.iter_mut().find(|b| b.index == index) {
            Some(b) => b,
            None => panic!("{}: buffer {} not in its bucket", op, index),
        }
    }
}

/// 缓冲块控制信息，随桶成员关系一起移动。
#[derive(Debug, Clone, Copy)]
struct BufCtrl {
    dev: u32,
    blockno: u32,

    /// 正在使用（读写或钉住）该块的持有者数量，为 0 时才可被回收。
    refcnt: usize,

    /// 最近一次变为空闲（或被回收）时的逻辑时间，越小越久未用。
    timestamp: u64,

    /// 对应的槽位。
    index: usize,
}

impl BufCtrl {
    const fn new(index: usize) -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            timestamp: 0,
            index,
        }
    }
}

/// 缓冲块槽位：数据与有效位，位置固定。
///
/// 有效位在持有所属桶锁（回收时置假）或持有数据睡眠锁（读盘后置真）时才被修改。
struct BufInner {
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    steals: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
        }
    }
}

/// 缓存统计快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcacheStats {
    pub hits: u64,
    /// 未命中次数，每次都把一个缓冲块改绑到新的块上。
    pub misses: u64,
    /// 跨桶回收次数。
    pub steals: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    /// 按桶编号排列的桶锁统计。
    pub buckets: Vec<LockStats>,
}

/// 单个缓冲块控制信息的快照，见 [`Bcache::snapshot`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufState {
    pub bucket: usize,
    pub index: usize,
    pub dev: u32,
    pub blockno: u32,
    pub refcnt: usize,
    pub timestamp: u64,
}
