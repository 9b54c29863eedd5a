#![allow(clippy::comparison_chain)]
#![warn(unused_imports)]
#![warn(unused_must_use)]

pub mod code_unit;
pub mod config;
pub mod context;
pub mod frame;
pub mod inline;
pub mod memory;
pub mod register;
pub mod stack;
pub mod vm;
pub mod walker;

use bitflags::bitflags;

bitflags! {
    /// Tag bits stored in the low bits of a frame's caller link.
    pub struct FrameTags: u64 {
        /// The caller is native code rather than another interpreter frame.
        const HOST_BOUNDARY = 0b0000_0001;
        /// This frame was materialized by the inline-frame resolver
        /// and does not exist on the machine stack.
        const INLINED = 0b0000_0010;
    }
}

pub use code_unit::{CodeLocation, CodeOrigin, CodeUnit, CodeUnitId, CodeUnitTable, CompiledCode};
pub use config::{MemoryBackend, StackConfig};
pub use context::StackContext;
pub use frame::{CallFrame, CallerLink, Frame, FrameLocation};
pub use inline::{InlineFrame, InlineFrameId};
pub use register::Register;
pub use stack::InterpreterStack;
pub use vm::{exception::Continuation, VMError, VM};
