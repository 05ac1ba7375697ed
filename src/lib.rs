//! User space call chain unwinding for a sampling profiler on ARM.
//!
//! For every sample, [`Unwinder::get_user_callchain`] walks the stack of the
//! interrupted task and collects return addresses into a [`Callchain`]. Three
//! methods cooperate:
//!
//!  - the ARM exception tables (`.ARM.exidx` / `.ARM.extab`), for 32-bit tasks,
//!  - DWARF CFI (`.eh_frame` / `.debug_frame`, with their search tables),
//!  - frame pointer walking, as a fallback where no table is available.
//!
//! The tables are uploaded by the profiling daemon and kept in a [`Registry`],
//! keyed by the start address of the mapping they describe. The task's memory
//! is only ever accessed through the [`AddressSpace`] trait.
//!
//! ```
//! use std::sync::Arc;
//! use quadd_unwind::{
//!     AddressSpace, Cache, Callchain, Registry, Task, UnwindConfig, UnwindMethods, Unwinder,
//!     UserRegs, Vma,
//! };
//!
//! struct NoMemory;
//!
//! impl AddressSpace for NoMemory {
//!     fn find_vma(&self, _addr: u64) -> Option<Vma> {
//!         None
//!     }
//!     fn read_bytes(&self, _addr: u64, _buf: &mut [u8]) -> Result<(), ()> {
//!         Err(())
//!     }
//! }
//!
//! struct Process(NoMemory);
//!
//! impl Task for Process {
//!     type Mm = NoMemory;
//!     fn mm(&self) -> Option<&NoMemory> {
//!         Some(&self.0)
//!     }
//! }
//!
//! let registry: Arc<Registry<Vec<u8>>> = Arc::new(Registry::new());
//! let unwinder = Unwinder::new(registry, UnwindMethods::default(), UnwindConfig::default());
//! let mut cc = Callchain::new();
//! let mut cache = Cache::new();
//!
//! let regs = UserRegs::new_arm32(0x1_0000, 0x7000_0000, 0x1_0100, 0, 0, false);
//! let nr = unwinder.get_user_callchain(&regs, &Process(NoMemory), false, &mut cc, &mut cache);
//! assert_eq!(nr, 0);
//! ```

mod cache;
mod callchain;
mod display_utils;
mod error;
mod instruction_analysis;
mod memory;
mod registry;
mod unwinder;
mod unwinders;
mod unwindregs;

pub use cache::Cache;
pub use callchain::{
    Address, Callchain, CallchainEntry, ResumeState, UnwindType, MAX_STACK_DEPTH,
};
pub use error::{RegistryError, ResultCode, UnwindError};
pub use instruction_analysis::{check_unwind_result, disassemble, DisasmData};
pub use memory::{
    is_vma_addr, validate_pc_addr, validate_stack_addr, AddressSpace, SectionReader, Task, Vma,
};
pub use registry::{
    ExceptionRegion, ExceptionTableUpload, ExtabInfo, MmapArea, RegionRef, RegionsData, Registry,
    SectionInfo, SectionKind, EXTABS_SIZE,
};
pub use unwinder::{UnwindConfig, UnwindMethods, Unwinder};
pub use unwindregs::{Mode, UserRegs, ARM32_FP_THUMB};
