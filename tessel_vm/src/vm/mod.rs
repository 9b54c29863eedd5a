pub mod exception;

use std::sync::Arc;
use tessel_log::*;
use thiserror::Error;

use crate::{
    code_unit::{CodeLocation, CodeUnit, CodeUnitId, CodeUnitTable},
    config::StackConfig,
    context::StackContext,
    frame::{CallFrame, CallerLink, CodeRef, Frame},
    register::Register,
    stack::{InterpreterStack, NewStackError},
};
use exception::ExceptionHandler;

#[derive(Debug, Error)]
pub enum VMError {
    #[error("Couldn't create the interpreter stack: {0}")]
    NewStack(#[from] NewStackError),
    #[error("Stack overflow (tried to push a frame of {frame_size} slots onto a stack {top} slots deep)")]
    StackOverflow { top: usize, frame_size: usize },
    #[error("There is no code unit with id {0}")]
    NoSuchCodeUnit(CodeUnitId),
}

pub struct VM {
    pub(crate) stack: InterpreterStack,
    pub(crate) code_units: CodeUnitTable,
    pub(crate) exception: Option<Register>,
    /// Where the pending exception was raised, after fixing up.
    pub(crate) exception_location: Option<CodeLocation>,
    /// The last location fixed up on the throw path.
    pub(crate) fixed_location: Option<(CallFrame, CodeLocation)>,
    pub(crate) top_call_frame: Option<CallFrame>,
    pub(crate) handler: Option<ExceptionHandler>,
    pub(crate) error_handling_depth: usize,
}

impl VM {
    pub fn new(context: Arc<StackContext>, config: &StackConfig) -> Result<Self, VMError> {
        let stack = InterpreterStack::new(context, config)?;

        Ok(Self {
            stack,
            code_units: CodeUnitTable::new(),
            exception: None,
            exception_location: None,
            fixed_location: None,
            top_call_frame: None,
            handler: None,
            error_handling_depth: 0,
        })
    }

    pub fn stack(&self) -> &InterpreterStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut InterpreterStack {
        &mut self.stack
    }

    pub fn context(&self) -> &Arc<StackContext> {
        self.stack.context()
    }

    pub fn frame(&self, frame: CallFrame) -> Frame<'_> {
        self.stack.frame(frame)
    }

    pub fn add_code_unit(&mut self, unit: Arc<dyn CodeUnit>) -> CodeUnitId {
        let id = self.code_units.insert(unit);
        trace!("registered code unit {}", id);
        id
    }

    pub fn remove_code_unit(&mut self, id: CodeUnitId) -> Option<Arc<dyn CodeUnit>> {
        self.code_units.remove(id)
    }

    pub fn code_unit(&self, id: CodeUnitId) -> Option<&Arc<dyn CodeUnit>> {
        self.code_units.get(id)
    }

    /// The code unit running in `frame`, if it has one and it's still alive.
    pub fn code_unit_of(&self, frame: CallFrame) -> Option<Arc<dyn CodeUnit>> {
        self.stack
            .frame(frame)
            .code_unit()
            .and_then(|id| self.code_units.get(id))
            .cloned()
    }

    /// Pushes a frame for `code`, which becomes the top call frame.
    pub fn push(
        &mut self,
        caller: CallerLink,
        code: Option<CodeUnitId>,
        scope: Register,
        argument_count: u32,
        callee: Register,
    ) -> Result<CallFrame, VMError> {
        let code = match code {
            Some(id) => {
                let unit = self.code_units.get(id).ok_or(VMError::NoSuchCodeUnit(id))?;
                Some(CodeRef {
                    id,
                    local_registers: unit.local_register_count(),
                })
            },

            None => None,
        };

        let frame = self
            .stack
            .push(caller, code, scope, argument_count, callee)
            .ok_or_else(|| VMError::StackOverflow {
                top: self.stack.top(),
                frame_size: crate::frame::HEADER_SIZE
                    + argument_count as usize
                    + code.map_or(0, |code| code.local_registers as usize),
            })?;

        self.top_call_frame = Some(frame);
        Ok(frame)
    }

    /// Pops `frame`, making its caller the top call frame.
    pub fn pop(&mut self, frame: CallFrame) {
        let caller = match self.stack.frame(frame).caller_link() {
            CallerLink::Frame(caller) => Some(caller),
            CallerLink::Host(caller) => caller,
        };

        self.stack.pop(frame);
        self.top_call_frame = caller;
    }

    pub fn top_call_frame(&self) -> Option<CallFrame> {
        self.top_call_frame
    }

    pub fn set_top_call_frame(&mut self, frame: Option<CallFrame>) {
        self.top_call_frame = frame;
    }

    /// Makes `exception` the pending exception.
    pub fn set_exception(&mut self, exception: Register) {
        self.exception = Some(exception);
    }

    pub fn exception(&self) -> Option<Register> {
        self.exception
    }

    pub fn exception_location(&self) -> Option<CodeLocation> {
        self.exception_location
    }

    /// Where the last dispatched exception will be handled.
    pub fn handler(&self) -> Option<ExceptionHandler> {
        self.handler
    }

    pub fn in_error_handling_mode(&self) -> bool {
        self.error_handling_depth > 0
    }
}
