#[cfg(not(target_pointer_width = "64"))]
compile_error!("tokpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// manager + configuration
pub use memory::manager::{
    ClassStatus, GlobalPoolManager, PoolManager, PoolManagerConfig, Status,
};

// process-wide gauges
pub use memory::stats::MemoryGauges;

// errors
pub use memory::os::OsMemError;
