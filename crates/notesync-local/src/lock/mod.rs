mod file;
mod memory;

pub use file::FileLockStore;
pub use memory::MemoryLockStore;
