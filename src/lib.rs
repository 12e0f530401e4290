pub mod addr_space;
pub mod error;
pub mod frame_table;
pub mod manager;
pub mod swap_store;

mod fault;
mod tlb_sync;

/// Process identifier. Processes themselves (threads, syscalls, exec) are
/// managed elsewhere; the memory system only needs to tell owners apart.
pub type Pid = u32;

pub use addr_space::{
    AddressSpace, AddressSpaceKind, ByteImage, PageTableEntry, ProgramImage, Section,
};
pub use error::VmError;
pub use manager::{MemoryManager, PagingStats};
