//! Process-wide state shared by every stack.
//!
//! A `StackContext` is created once with [`StackContext::initialize`] and
//! handed to each [`InterpreterStack`][crate::stack::InterpreterStack]. It
//! owns the counters that have to be visible across VM instances and
//! threads: the number of bytes committed by all stacks, and the number of
//! stack walks that had to give up because the stack looked inconsistent.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tessel_log::*;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ContextError {
    #[error("stack context is still shared by {0} other owner(s)")]
    StillShared(usize),
    #[error("{0} bytes are still committed at teardown")]
    StillCommitted(usize),
}

#[derive(Debug, Default)]
pub struct StackContext {
    committed_bytes: AtomicUsize,
    inconsistent_stack_walks: AtomicUsize,
}

impl StackContext {
    pub fn initialize() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tears the context down. Fails if a stack still holds a
    /// reference to it or still has memory committed.
    pub fn teardown(self: Arc<Self>) -> Result<(), ContextError> {
        let owners = Arc::strong_count(&self);

        if owners > 1 {
            return Err(ContextError::StillShared(owners - 1));
        }

        match self.committed_byte_count() {
            0 => Ok(()),
            bytes => Err(ContextError::StillCommitted(bytes)),
        }
    }

    /// Bytes currently committed by every stack using this context.
    pub fn committed_byte_count(&self) -> usize {
        self.committed_bytes.load(Ordering::Acquire)
    }

    pub fn inconsistent_stack_walks(&self) -> usize {
        self.inconsistent_stack_walks.load(Ordering::Relaxed)
    }

    pub(crate) fn add_committed(&self, bytes: usize) {
        self.committed_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn remove_committed(&self, bytes: usize) {
        let previous = self.committed_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "committed byte count underflowed");
    }

    pub(crate) fn note_inconsistent_stack_walk(&self) {
        let count = self.inconsistent_stack_walks.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("inconsistent stack walks so far: {}", count);
    }
}
