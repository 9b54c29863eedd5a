//! The interpreter stack region.
//!
//! A stack reserves its whole capacity up front and commits memory in
//! fixed-size chunks as the top of the stack moves up. Positions on the
//! stack are slot indices counted from the base of the reservation:
//!
//! ```none
//! base                top         commit_end      usable_end   reserved_end
//!  |-------------------|---------------|---------------|--------------|
//!    frames in use       committed slack   uncommitted     error reserve
//! ```
//!
//! The last commit chunk is held back as an error reserve so that the code
//! reporting a stack overflow has room to run.

#[cfg(test)]
mod tests;

use std::{ops::Range, ptr::NonNull, slice, sync::Arc};
use tessel_log::*;
use thiserror::Error;

use crate::{
    config::{round_up, ConfigError, StackConfig},
    context::StackContext,
    memory::{self, MemoryError, PageReservation},
    register::Register,
};

#[derive(Debug, Error)]
pub enum NewStackError {
    #[error("invalid stack configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Receives the conservative roots held on a stack.
pub trait RootVisitor {
    fn add_roots(&mut self, roots: &[Register]);

    /// Like `add_roots`, also offering every candidate to auxiliary root
    /// sets (for example JIT stubs that must stay alive while a frame
    /// may still return into them).
    fn add_roots_with(&mut self, roots: &[Register], auxiliary: &mut [&mut dyn AuxiliaryRoots]) {
        self.add_roots(roots);

        for set in auxiliary.iter_mut() {
            for &candidate in roots {
                set.note_candidate(candidate);
            }
        }
    }
}

pub trait AuxiliaryRoots {
    fn note_candidate(&mut self, candidate: Register);
}

pub struct InterpreterStack {
    reservation: Box<dyn PageReservation>,
    base: NonNull<Register>,
    /// All of these are slot indices from `base`.
    top: usize,
    commit_end: usize,
    usable_end: usize,
    reserved_end: usize,
    /// In bytes.
    commit_granularity: usize,
    /// In bytes.
    max_excess_capacity: usize,
    context: Arc<StackContext>,
}

// A stack belongs to one thread of execution at a time,
// but may be handed to another one.
unsafe impl Send for InterpreterStack {}

impl InterpreterStack {
    pub fn new(context: Arc<StackContext>, config: &StackConfig) -> Result<Self, NewStackError> {
        config.validate()?;

        let size = config.reservation_size();
        let reservation = memory::reserve(config.backend, size)?;
        let base = reservation.base().cast::<Register>();
        let reserved_end = size / Register::SIZE;
        let chunk = config.commit_granularity / Register::SIZE;

        debug!(
            "reserved {} bytes for an interpreter stack at {:p}",
            size,
            base.as_ptr()
        );

        Ok(Self {
            reservation,
            base,
            top: 0,
            commit_end: 0,
            usable_end: reserved_end - chunk,
            reserved_end,
            commit_granularity: config.commit_granularity,
            max_excess_capacity: config.max_excess_capacity,
            context,
        })
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn commit_end(&self) -> usize {
        self.commit_end
    }

    pub fn usable_end(&self) -> usize {
        self.usable_end
    }

    pub fn reserved_end(&self) -> usize {
        self.reserved_end
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    pub fn context(&self) -> &Arc<StackContext> {
        &self.context
    }

    /// Bytes committed by this stack alone.
    pub fn committed_bytes(&self) -> usize {
        self.commit_end * Register::SIZE
    }

    /// Bytes committed by every stack sharing this stack's context.
    pub fn committed_byte_count(&self) -> usize {
        self.context.committed_byte_count()
    }

    /// Makes sure everything below `new_top` is committed and moves the
    /// top of the stack up to it. Never moves the top down.
    ///
    /// Returns `false` without changing anything if committing enough
    /// memory would run into the error reserve. Callers should treat
    /// this as a stack overflow.
    pub fn grow(&mut self, new_top: usize) -> bool {
        if new_top <= self.top {
            return true;
        }

        if new_top <= self.commit_end {
            self.top = new_top;
            return true;
        }

        // Bounds the arithmetic below.
        if new_top > self.usable_end {
            trace!(
                "can't grow stack to slot {} (usable end is slot {})",
                new_top,
                self.usable_end
            );
            return false;
        }

        let shortfall = (new_top - self.commit_end) * Register::SIZE;
        let delta = round_up(shortfall, self.commit_granularity);

        if self.committed_bytes() + delta > self.usable_end * Register::SIZE {
            trace!(
                "can't grow stack to slot {} (usable end is slot {})",
                new_top,
                self.usable_end
            );
            return false;
        }

        if let Err(err) = self.reservation.commit(self.committed_bytes(), delta) {
            error!("couldn't grow the interpreter stack: {}", err);
            return false;
        }

        self.context.add_committed(delta);
        self.commit_end += delta / Register::SIZE;
        self.top = new_top;

        trace!(
            "committed {} bytes (stack now has {} committed)",
            delta,
            self.committed_bytes()
        );

        true
    }

    /// Moves the top of the stack down to `new_top`. Never moves it up.
    ///
    /// Once the stack is empty again, committed memory past the excess
    /// capacity threshold is given back to the OS.
    pub fn shrink(&mut self, new_top: usize) {
        if new_top >= self.top {
            return;
        }

        self.top = new_top;

        if self.top == 0 && self.committed_bytes() > self.max_excess_capacity {
            self.release_excess_capacity();
        }
    }

    /// Decommits everything above the base of the stack.
    /// Does nothing unless the stack is empty.
    pub fn release_excess_capacity(&mut self) {
        if self.top != 0 {
            return;
        }

        self.decommit_above(0);
    }

    /// Lets the stack grow into the error reserve.
    pub fn enable_error_reserve(&mut self) {
        debug!("enabling the stack error reserve");
        self.usable_end = self.reserved_end;
    }

    /// Takes the error reserve away again.
    ///
    /// Anything on the stack past the narrowed usable end was pushed by
    /// error handling code, which has finished by the time this is called,
    /// so the stack is cut back to the usable end.
    pub fn disable_error_reserve(&mut self) {
        debug!("disabling the stack error reserve");
        self.usable_end = self.reserved_end - self.commit_granularity / Register::SIZE;

        if self.top > self.usable_end {
            self.shrink(self.usable_end);
        }

        if self.commit_end > self.usable_end {
            self.decommit_above(self.usable_end);
        }
    }

    pub fn error_reserve_enabled(&self) -> bool {
        self.usable_end == self.reserved_end
    }

    /// Whether `slot` is part of the stack in use.
    pub fn contains(&self, slot: usize) -> bool {
        slot < self.top
    }

    /// Address of a slot. For diagnostics only.
    pub fn address_of(&self, slot: usize) -> *const Register {
        self.base.as_ptr().wrapping_add(slot)
    }

    pub fn slot(&self, index: usize) -> Register {
        self.committed()[index]
    }

    pub fn set_slot(&mut self, index: usize, value: Register) {
        self.committed_mut()[index] = value;
    }

    pub fn slots(&self, range: Range<usize>) -> &[Register] {
        &self.committed()[range]
    }

    pub fn slots_mut(&mut self, range: Range<usize>) -> &mut [Register] {
        &mut self.committed_mut()[range]
    }

    /// Hands every slot in use to `visitor` as a potential root.
    ///
    /// The collector must only call this while the thread owning the
    /// stack is stopped at a safe point: nothing here stops the stack
    /// from changing underneath the visitor.
    pub fn gather_conservative_roots(&self, visitor: &mut dyn RootVisitor) {
        visitor.add_roots(self.slots(0..self.top));
    }

    /// Like [`gather_conservative_roots`][Self::gather_conservative_roots],
    /// also offering every slot to the given auxiliary root sets.
    pub fn gather_conservative_roots_with(
        &self,
        visitor: &mut dyn RootVisitor,
        auxiliary: &mut [&mut dyn AuxiliaryRoots],
    ) {
        visitor.add_roots_with(self.slots(0..self.top), auxiliary);
    }

    fn committed(&self) -> &[Register] {
        // Everything below `commit_end` is committed, readable memory
        // owned by `self.reservation`.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.commit_end) }
    }

    fn committed_mut(&mut self) -> &mut [Register] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.commit_end) }
    }

    /// Decommits everything from `slot` up to the committed end.
    /// `slot` must lie on a commit chunk boundary.
    fn decommit_above(&mut self, slot: usize) {
        debug_assert!(slot >= self.top);
        debug_assert_eq!((slot * Register::SIZE) % self.commit_granularity, 0);

        if slot >= self.commit_end {
            return;
        }

        let offset = slot * Register::SIZE;
        let delta = self.committed_bytes() - offset;

        if let Err(err) = self.reservation.decommit(offset, delta) {
            error!("couldn't release interpreter stack memory: {}", err);
            return;
        }

        self.context.remove_committed(delta);
        self.commit_end = slot;

        trace!(
            "decommitted {} bytes (stack now has {} committed)",
            delta,
            self.committed_bytes()
        );
    }
}

impl Drop for InterpreterStack {
    fn drop(&mut self) {
        self.top = 0;
        self.decommit_above(0);
    }
}
