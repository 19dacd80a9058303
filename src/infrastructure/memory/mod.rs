//! Memory Layer - In-Memory State Management
//!
//! 实现 CommandStore，指令台账只存活于进程内存

mod command_store;

pub use command_store::InMemoryCommandStore;
