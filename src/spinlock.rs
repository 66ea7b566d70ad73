//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据，只适合极短的临界区。

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::process::{CpuManager, pop_off, push_off};

/// 连续自旋这么多次仍未拿到锁时让出一次时间片。
///
/// 宿主线程可能在持锁期间被操作系统抢占，一直忙等只会拖慢持有者。
const SPINS_BEFORE_YIELD: u32 = 64;

/// 表示一个自旋锁结构，用于在多执行流环境下保护共享数据。
///
/// `SpinLock` 通过忙等待实现互斥：锁被占用时，尝试获取锁的执行流
/// 在循环中等待，直到锁被释放。该锁还记录持有者的执行流编号，
/// 用于发现重入与错误释放，并统计获取次数与自旋次数，
/// 用来观察哈希桶之间的锁竞争。
///
/// 持有自旋锁期间不得睡眠：睡眠锁的获取会通过 `noff` 检查这一点。
///
/// # 字段说明
/// - `lock`: 锁状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试与统计；
/// - `cpuid`: 当前持有者的执行流编号（0 表示无人持有）；
/// - `nacquire` / `nspin`: 获取次数与获取失败后的自旋次数；
/// - `data`: 被保护的数据。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicUsize,
    nacquire: AtomicU64,
    nspin: AtomicU64,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicUsize::new(0),
            nacquire: AtomicU64::new(0),
            nspin: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权。守卫对象实现了`Deref`和`DerefMut`，
    /// 离开作用域时自动释放锁。
    ///
    /// # 流程解释
    /// 1. 检查当前执行流是否已持有该锁（重入即死锁，直接 panic）；
    /// 2. 调用`push_off()`记录进入自旋锁临界区；
    /// 3. 通过原子比较交换忙等待直到获取锁，失败一次记一次自旋；
    /// 4. 记录持有者编号，返回守卫对象。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 检查当前执行流是否持有此锁。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == CpuManager::cpu_id()
    }

    /// 读取该锁的获取与竞争统计。
    pub fn stats(&self) -> LockStats {
        LockStats {
            name: self.name,
            acquires: self.nacquire.load(Ordering::Relaxed),
            spins: self.nspin.load(Ordering::Relaxed),
        }
    }

    fn acquire(&self) {
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        push_off();
        self.nacquire.fetch_add(1, Ordering::Relaxed);

        let mut spins = 0u32;
        while self.lock.compare_exchange_weak(false, true,
            Ordering::Acquire, Ordering::Relaxed).is_err() {
            self.nspin.fetch_add(1, Ordering::Relaxed);
            spins += 1;
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                spin_loop();
            }
        }
        self.cpuid.store(CpuManager::cpu_id(), Ordering::Relaxed);
    }

    /// 释放锁的核心实现，由守卫的`Drop`调用。
    ///
    /// # 流程解释
    /// 1. 验证当前执行流确实持有锁；
    /// 2. 清除持有者编号；
    /// 3. 以`Release`序存储`false`释放锁；
    /// 4. 调用`pop_off()`退出一层临界区。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(0, Ordering::Relaxed);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 守卫不能跨线程移动：持有者编号与临界区层数都记录在获取它的执行流上。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁。
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// 一把自旋锁的统计快照。
///
/// `spins` 与 `acquires` 的比值反映该锁的竞争程度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub name: &'static str,
    pub acquires: u64,
    pub spins: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 基础功能测试：守卫立即丢弃，连续两次获取都应成功。
    #[test]
    fn smoke() {
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
        assert_eq!(m.stats().acquires, 2);
        assert!(!m.holding());
    }

    #[test]
    fn guard_tracks_holder_and_noff() {
        let m = SpinLock::new(5u32, "holder");
        {
            let mut guard = m.lock();
            *guard += 1;
            assert!(m.holding());
            assert_eq!(CpuManager::noff(), 1);

            let seen_elsewhere = std::thread::scope(|s| s.spawn(|| m.holding()).join().unwrap());
            assert!(!seen_elsewhere);
        }
        assert_eq!(CpuManager::noff(), 0);
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    #[should_panic(expected = "spinlock reentrant acquire")]
    fn reentrant_acquire_panics() {
        let m = SpinLock::new((), "reentrant");
        let _outer = m.lock();
        let _inner = m.lock();
    }

    #[test]
    fn concurrent_increments() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;

        let m = SpinLock::new(0usize, "counter");
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*m.lock(), THREADS * ROUNDS);
        assert_eq!(m.stats().acquires, (THREADS * ROUNDS + 1) as u64);
        assert_eq!(m.stats().name, "counter");
    }
}
