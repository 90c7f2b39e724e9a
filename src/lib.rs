#[cfg(not(target_pointer_width = "64"))]
compile_error!("keel supports only 64-bit targets.");

pub(crate) mod sync;

pub mod app;
pub mod exec;
pub mod memory;
pub mod util;

mod integration;

// allocators
pub use memory::allocator::{AllocFn, Allocator, AllocatorState, DeallocFn};
pub use memory::buddy::{BuddyPool, BuddyPoolCreateInfo, BuddyPoolState};
pub use memory::cache::{MemoryCache, MemoryCacheCreateInfo};

// task execution
pub use exec::classic::{ClassicThreadPool, Priority};
pub use exec::free_list::{FixedSizeFreeList, INVALID_INDEX};
pub use exec::promise::{wait_all, TaskFuture};
pub use exec::thread_pool::ThreadPool;

// application loop
pub use app::precise_sleep::PreciseSleep;
pub use app::{AppDelegate, Application, ApplicationCreateInfo};
