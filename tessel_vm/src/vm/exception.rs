//! The throw path.
//!
//! Machine code that finds a pending exception calls into here with the
//! frame and location it stopped at. The location is moved back onto the
//! call that raised the exception, the logical frame is recovered, and the
//! unwinder decides where execution continues. Machine code then jumps to
//! whichever trampoline the returned [`Continuation`] names.

use std::ops::{Deref, DerefMut};
use tessel_log::*;

use super::VM;
use crate::{
    code_unit::CodeLocation, frame::CallFrame, inline::OriginKey, register::Register,
};

/// Where machine code goes after handing an exception over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Continuation {
    /// Jump straight to the throw trampoline.
    ThrowTrampoline,
    /// Re-enter through the trampoline used for calls into the runtime.
    CallThrowTrampoline,
}

/// Where the unwinder found a handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExceptionHandler {
    /// The frame that catches the exception, or `None` if it escapes to the
    /// host.
    pub frame: Option<CallFrame>,
    pub location: Option<CodeLocation>,
}

/// Unwinds frames until a handler for an exception is found.
pub trait Unwinder {
    fn unwind(
        &mut self,
        vm: &mut VM,
        frame: CallFrame,
        exception: Register,
        bytecode_offset: u32,
    ) -> ExceptionHandler;

    /// Builds the value thrown when the stack overflows.
    /// Runs with the error reserve available.
    fn create_stack_overflow_error(&mut self, vm: &mut VM) -> Register;
}

impl VM {
    /// Throws the pending exception at `location` in `frame`.
    pub fn return_to_throw(
        &mut self,
        unwinder: &mut dyn Unwinder,
        frame: CallFrame,
        location: CodeLocation,
    ) -> Continuation {
        self.top_call_frame = Some(frame);
        let location = self.fix_location(frame, location);
        self.dispatch(unwinder, frame, location);
        Continuation::ThrowTrampoline
    }

    /// Like [`return_to_throw`][Self::return_to_throw], for runtime calls
    /// that return through the call trampoline.
    pub fn call_to_throw(
        &mut self,
        unwinder: &mut dyn Unwinder,
        frame: CallFrame,
        location: CodeLocation,
    ) -> Continuation {
        self.top_call_frame = Some(frame);
        let location = self.fix_location(frame, location);
        self.dispatch(unwinder, frame, location);
        Continuation::CallThrowTrampoline
    }

    /// Throws the pending exception from the frame that called `frame`,
    /// which is about to return to `return_location`.
    ///
    /// If `frame` was called from the host, the exception is thrown from
    /// `frame` itself. `return_location` then belongs to host code, so it
    /// is passed on as it is rather than looked up in `frame`'s code unit.
    pub fn throw_in_caller(
        &mut self,
        unwinder: &mut dyn Unwinder,
        frame: CallFrame,
        return_location: CodeLocation,
    ) -> Continuation {
        let caller = self.stack.frame(frame).caller_frame();
        let (frame, location) = match caller {
            Some(caller) => (caller, self.fix_location(caller, return_location)),
            None => (frame, return_location),
        };

        self.top_call_frame = Some(frame);
        self.dispatch(unwinder, frame, location);
        Continuation::ThrowTrampoline
    }

    /// Throws a stack overflow error at `location` in `frame`.
    pub fn throw_stack_overflow(
        &mut self,
        unwinder: &mut dyn Unwinder,
        frame: CallFrame,
        location: CodeLocation,
    ) -> Continuation {
        let mut vm = ErrorHandlingMode::new(self);
        let error = unwinder.create_stack_overflow_error(&mut vm);

        debug!("throwing stack overflow error {}", error);
        vm.set_exception(error);
        vm.return_to_throw(unwinder, frame, location)
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
        self.exception_location = None;
        self.fixed_location = None;
        self.handler = None;
    }

    /// Moves a return location back to the start of its call.
    ///
    /// A location that was just produced by this for the same frame is
    /// left alone, so helpers calling each other on the throw path can all
    /// fix the same location.
    pub(crate) fn fix_location(&mut self, frame: CallFrame, location: CodeLocation) -> CodeLocation {
        if self.fixed_location == Some((frame, location)) {
            return location;
        }

        let fixed = self
            .code_unit_of(frame)
            .and_then(|code| code.call_site_for_return(location))
            .unwrap_or(location);

        self.fixed_location = Some((frame, fixed));
        fixed
    }

    fn dispatch(&mut self, unwinder: &mut dyn Unwinder, frame: CallFrame, location: CodeLocation) {
        debug_assert!(
            self.exception.is_some(),
            "dispatching an exception without one pending"
        );
        let exception = self.exception.unwrap_or(Register::EMPTY);

        self.exception_location = Some(location);

        let bytecode_offset = self
            .code_unit_of(frame)
            .and_then(|code| code.code_origin_for_call_site(location))
            .map_or(0, |origin| origin.bytecode_index);

        // Falls back on the physical frame if the inlined ones can't be
        // recovered, so the exception still gets thrown.
        let frame = self
            .resolve_inline_frame(frame, OriginKey::CallSite(location))
            .unwrap_or(frame);

        trace!(
            "dispatching {} from frame at slot {} (bytecode offset {})",
            exception,
            frame.slot(),
            bytecode_offset
        );

        let handler = unwinder.unwind(self, frame, exception, bytecode_offset);
        self.handler = Some(handler);
    }
}

/// Makes the stack's error reserve available for as long as it lives.
/// Nests.
pub struct ErrorHandlingMode<'vm> {
    vm: &'vm mut VM,
}

impl<'vm> ErrorHandlingMode<'vm> {
    pub fn new(vm: &'vm mut VM) -> Self {
        if vm.error_handling_depth == 0 {
            vm.stack.enable_error_reserve();
        }

        vm.error_handling_depth += 1;
        Self { vm }
    }
}

impl Deref for ErrorHandlingMode<'_> {
    type Target = VM;

    fn deref(&self) -> &Self::Target {
        self.vm
    }
}

impl DerefMut for ErrorHandlingMode<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.vm
    }
}

impl Drop for ErrorHandlingMode<'_> {
    fn drop(&mut self) {
        self.vm.error_handling_depth -= 1;

        if self.vm.error_handling_depth == 0 {
            self.vm.stack.disable_error_reserve();
        }
    }
}
