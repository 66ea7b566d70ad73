//! 执行流状态，用于记录当前线程的编号与自旋锁嵌套层数

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 下一个可分配的执行流编号。0 保留给“无持有者”。
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CPU: Cpu = Cpu::new();
}

/// 访问当前执行流状态的入口。
pub struct CpuManager;

impl CpuManager {
    /// 返回当前执行流的编号。
    ///
    /// 编号在线程首次访问时分配，线程存活期间保持不变，且从不为 0，
    /// 因此锁可以用 0 表示“没有持有者”。
    #[inline]
    pub fn cpu_id() -> usize {
        CPU.with(|c| c.id)
    }

    /// 当前执行流持有的自旋锁层数。
    #[inline]
    pub fn noff() -> usize {
        CPU.with(|c| c.noff.get())
    }
}

/// 单个执行流的状态。
struct Cpu {
    id: usize,

    /// `push_off()` 的嵌套深度，每持有一把自旋锁加 1。
    ///
    /// 深度不为 0 时不允许进入睡眠：睡眠锁的获取会检查这一点。
    noff: Cell<usize>,
}

impl Cpu {
    fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            noff: Cell::new(0),
        }
    }
}

/// # 功能说明
/// 记录当前执行流又进入了一层自旋锁临界区。
/// 多次调用 `push_off()` 需要相应次数的 `pop_off()` 才能回到可睡眠状态。
pub fn push_off() {
    CPU.with(|c| c.noff.set(c.noff.get() + 1));
}

/// # 功能说明
/// 解除一层由 `push_off()` 记录的自旋锁临界区。
///
/// # 可能的错误
/// - 调用次数多于 `push_off()` 时 panic，说明锁的获取与释放不配对。
pub fn pop_off() {
    CPU.with(|c| {
        match c.noff.get().checked_sub(1) {
            Some(noff) => c.noff.set(noff),
            None => panic!("pop_off(): count not match"),
        }
    });
}
