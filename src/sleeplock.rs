//! 睡眠锁模块
//! 提供基于休眠/唤醒机制的同步原语，适用于可能长时间持有的锁（例如跨越磁盘 I/O）。
//!
//! 当锁被占用时，尝试获取锁的执行流会进入休眠状态，避免忙等待。

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::process::CpuManager;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的执行流会进入休眠状态，
/// 直到锁被释放后被唤醒。
///
/// # 字段说明
/// - `lock`: 内部短锁，保护`locked`状态
/// - `wait`: 休眠等待的通道，释放锁时在此唤醒等待者
/// - `owner`: 持有者的执行流编号，0 表示无人持有
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: Mutex<bool>,
    wait: Condvar,
    owner: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: Mutex::new(false),
            wait: Condvar::new(),
            owner: AtomicUsize::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前执行流）
    ///
    /// # 流程解释
    /// 1. 确认当前执行流没有持有任何自旋锁，否则在睡眠期间会把自旋锁一起“带走”
    /// 2. 获取内部短锁，检查`locked`状态：
    ///   - 如果已锁定：在`wait`上休眠，被唤醒后重新检查
    ///   - 如果未锁定：设置`locked=true`，记录持有者
    /// 3. 释放内部短锁并返回守卫
    ///
    /// # 可能的错误
    /// - 持有自旋锁时调用会 panic，这是锁纪律错误而不是竞争
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        if CpuManager::noff() != 0 {
            panic!("sleeplock {}: acquire while holding spinlock", self.name);
        }

        let mut locked = self.lock.lock();
        while *locked {
            // 让当前执行流休眠，等待锁释放
            self.wait.wait(&mut locked);
        }
        *locked = true;
        self.owner.store(CpuManager::cpu_id(), Ordering::Relaxed);
        drop(locked);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 当前执行流是否持有该睡眠锁。
    pub fn holding(&self) -> bool {
        let locked = self.lock.lock();
        *locked && self.owner.load(Ordering::Relaxed) == CpuManager::cpu_id()
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let mut locked = self.lock.lock();
        *locked = false;
        self.owner.store(0, Ordering::Relaxed);
        drop(locked);
        self.wakeup();
    }

    /// 唤醒所有等待该锁的执行流，由它们重新竞争
    fn wakeup(&self) {
        self.wait.notify_all();
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 守卫离开作用域时自动释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::spinlock::SpinLock;

    #[test]
    fn holder_is_tracked() {
        let l = SleepLock::new(0u8, "holder");
        assert!(!l.holding());
        let guard = l.lock();
        assert!(l.holding());
        let seen_elsewhere = std::thread::scope(|s| s.spawn(|| l.holding()).join().unwrap());
        assert!(!seen_elsewhere);
        drop(guard);
        assert!(!l.holding());
    }

    #[test]
    fn second_locker_sleeps_until_release() {
        let l = SleepLock::new(Vec::new(), "order");
        let released = AtomicBool::new(false);

        std::thread::scope(|s| {
            let mut guard = l.lock();
            let waiter = s.spawn(|| {
                let mut guard = l.lock();
                // 只有第一个持有者放手之后才能走到这里
                assert!(released.load(Ordering::SeqCst));
                guard.push(2);
            });
            std::thread::sleep(Duration::from_millis(20));
            guard.push(1);
            released.store(true, Ordering::SeqCst);
            drop(guard);
            waiter.join().unwrap();
        });

        assert_eq!(*l.lock(), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "acquire while holding spinlock")]
    fn sleeping_under_spinlock_panics() {
        let spin = SpinLock::new((), "bucket");
        let sleep = SleepLock::new((), "buffer");
        let _bucket = spin.lock();
        let _buffer = sleep.lock();
    }
}
