//! 执行流管理
//!
//! 宿主环境下每个操作系统线程扮演内核中的一个执行流（hart 上运行的内核线程），
//! 这里只保留锁纪律检查所需的那部分状态：执行流编号与自旋锁嵌套层数。

mod cpu;

pub use cpu::CpuManager;
pub use cpu::{push_off, pop_off};
