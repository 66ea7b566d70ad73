//! 编译期常量

pub mod fs;
