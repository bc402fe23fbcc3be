//! Stack unwinding: register capture, raw stack reads, the generic native
//! unwinders and the hybrid walker that combines them with managed frames.

pub mod cfi;
pub mod context;
pub mod memory;
pub mod native;
pub mod walker;

pub use cfi::{CfiModule, CfiTables, CfiUnwinder, NativeCursor, cfi_module};
pub use context::RegisterContext;
pub use memory::{LocalMemory, StackReader, SyntheticStack};
pub use native::{FramePointerUnwinder, GenericUnwinder, StepResult, UnwindCursor};
pub use walker::{HybridStackWalker, INIT_SIGNAL_FRAME, StopReason, WalkResult};
