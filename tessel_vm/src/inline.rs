//! Recovering inlined frames.
//!
//! When a JIT inlines a call, the callee gets no frame of its own: one
//! physical frame runs code belonging to several logical functions. Anything
//! that wants to see logical frames (exception dispatch, backtraces) asks
//! the resolver to materialize the missing ones as synthetic frames inside
//! the physical frame's slots, using the descriptors the JIT left behind.

use std::{fmt, ops::Index};
use tessel_log::*;

use crate::{
    code_unit::{CodeLocation, CodeOrigin, CodeUnit},
    frame::{CallFrame, CallerLink, FrameLocation},
    register::Register,
    vm::VM,
    FrameTags,
};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InlineFrameId(u32);

impl InlineFrameId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InlineFrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inline#{}", self.0)
    }
}

/// Describes one inlined call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InlineFrame {
    /// `None` if the callee is only known at runtime, in which case the
    /// machine code stores it in the synthetic frame's callee slot itself.
    pub callee: Option<Register>,
    /// Same as `callee`, for the callee's scope.
    pub scope: Option<Register>,
    pub argument_count: u32,
    /// Where the synthetic frame's frame pointer lies, in slots from the
    /// physical frame pointer.
    pub stack_offset: i32,
    /// The call site this frame was inlined at.
    pub caller: CodeOrigin,
}

#[derive(Clone, Debug, Default)]
pub struct InlineFrameArena {
    frames: Vec<InlineFrame>,
}

impl InlineFrameArena {
    pub fn push(&mut self, frame: InlineFrame) -> InlineFrameId {
        self.frames.push(frame);
        InlineFrameId((self.frames.len() - 1) as u32)
    }

    pub fn get(&self, id: InlineFrameId) -> Option<&InlineFrame> {
        self.frames.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InlineFrameId, &InlineFrame)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(index, frame)| (InlineFrameId(index as u32), frame))
    }
}

impl Index<InlineFrameId> for InlineFrameArena {
    type Output = InlineFrame;

    fn index(&self, id: InlineFrameId) -> &Self::Output {
        &self.frames[id.0 as usize]
    }
}

/// How to find the origin a physical frame is stopped at.
#[derive(Clone, Copy, Debug)]
pub(crate) enum OriginKey {
    /// The frame is waiting for a call returning to this location.
    Return(CodeLocation),
    /// The frame is somewhere inside the call sequence at this location.
    CallSite(CodeLocation),
    /// The frame stored a captured origin index in its location slot.
    CapturedIndex,
}

/// One synthetic frame about to be written.
struct Synthetic {
    frame: CallFrame,
    id: InlineFrameId,
    descriptor: InlineFrame,
    bytecode_offset: u32,
}

impl VM {
    /// Finds the logical frame `frame` is executing in.
    ///
    /// `location` is where `frame` will resume once its callee returns. Pass
    /// `None` if `frame` stored a captured origin index before calling out.
    /// Returns `None` if the frame's metadata doesn't add up.
    pub fn true_frame(
        &mut self,
        frame: CallFrame,
        location: Option<CodeLocation>,
    ) -> Option<CallFrame> {
        let key = match location {
            Some(location) => OriginKey::Return(location),
            None => OriginKey::CapturedIndex,
        };

        self.resolve_inline_frame(frame, key)
    }

    /// Finds the logical caller of `frame`.
    pub fn true_caller_frame(&mut self, frame: CallFrame) -> Option<CallFrame> {
        let view = self.stack.frame(frame);

        // Synthetic frames already link to their logical caller.
        if view.is_inlined() {
            return view.caller_frame();
        }

        let caller = view.caller_frame()?;
        // Without a return location the caller is still in its entry
        // trampoline and left a captured origin index behind instead.
        let location = view.return_location();
        self.true_frame(caller, location)
    }

    pub(crate) fn resolve_inline_frame(
        &mut self,
        frame: CallFrame,
        key: OriginKey,
    ) -> Option<CallFrame> {
        let header = self.stack.header(frame);

        if header.is_inlined() {
            return Some(frame);
        }

        let id = match header.code_unit() {
            Some(id) => id,
            None => return Some(frame),
        };

        let code = match self.code_units.get(id) {
            Some(code) => code.clone(),
            None => {
                self.inconsistent_stack_walk(frame, format_args!("code unit {} is gone", id));
                return None;
            },
        };

        if !code.has_inlined_frames() {
            return Some(frame);
        }

        let origin = match key {
            OriginKey::Return(location) => code.code_origin_for_return(location),
            OriginKey::CallSite(location) => code.code_origin_for_call_site(location),
            OriginKey::CapturedIndex => match header.location() {
                Some(FrameLocation::OriginIndex(index)) => {
                    debug_assert!(
                        (index as usize) < code.code_origin_count(),
                        "captured origin index {} out of range in {}",
                        index,
                        code.name()
                    );
                    code.code_origin_at_index(index)
                },
                _ => None,
            },
        };

        let origin = match origin {
            Some(origin) => origin,
            None => {
                self.inconsistent_stack_walk(
                    frame,
                    format_args!("no code origin for {:?} in {}", key, code.name()),
                );
                return None;
            },
        };

        if origin.inline_frame.is_none() {
            return Some(frame);
        }

        self.materialize(frame, &*code, origin)
    }

    /// Writes a synthetic frame for each inlined call around `origin`,
    /// returning the innermost one.
    fn materialize(
        &mut self,
        physical: CallFrame,
        code: &dyn CodeUnit,
        origin: CodeOrigin,
    ) -> Option<CallFrame> {
        let arena = code.inline_frames();
        let mut chain = Vec::new();
        let mut current = origin;

        while let Some(id) = current.inline_frame {
            let descriptor = match arena.get(id) {
                Some(descriptor) if chain.len() < arena.len() => *descriptor,
                Some(_) => {
                    self.inconsistent_stack_walk(
                        physical,
                        format_args!("inline frames of {} form a cycle", code.name()),
                    );
                    return None;
                },
                None => {
                    self.inconsistent_stack_walk(
                        physical,
                        format_args!("{} doesn't exist in {}", id, code.name()),
                    );
                    return None;
                },
            };

            let frame = match physical.offset_by(descriptor.stack_offset) {
                Some(frame) if self.fits_beside(physical, frame, descriptor.argument_count) => frame,
                _ => {
                    self.inconsistent_stack_walk(
                        physical,
                        format_args!("{} has a bad stack offset ({})", id, descriptor.stack_offset),
                    );
                    return None;
                },
            };

            chain.push(Synthetic {
                frame,
                id,
                descriptor,
                bytecode_offset: current.bytecode_index,
            });
            current = descriptor.caller;
        }

        let physical_header = *self.stack.header(physical);

        for (index, synthetic) in chain.iter().enumerate() {
            let caller = chain
                .get(index + 1)
                .map_or(physical, |outer| outer.frame);

            let header = self.stack.header_mut(synthetic.frame);
            header.set_code_unit(physical_header.code_unit());
            header.set_caller(CallerLink::Frame(caller), FrameTags::INLINED);
            header.set_inline_frame(synthetic.id);
            header.set_argument_count(synthetic.descriptor.argument_count, 0);
            header.set_location(Some(FrameLocation::BytecodeOffset(synthetic.bytecode_offset)));

            if let Some(callee) = synthetic.descriptor.callee {
                header.set_callee(callee);
            }

            if let Some(scope) = synthetic.descriptor.scope {
                header.set_scope(scope);
            }
        }

        trace!(
            "materialized {} inlined frame(s) in frame at slot {}",
            chain.len(),
            physical.slot()
        );

        chain.first().map(|innermost| innermost.frame)
    }

    /// Whether a synthetic frame at `frame` stays on the stack in use and
    /// clear of the physical frame's header.
    fn fits_beside(&self, physical: CallFrame, frame: CallFrame, argument_count: u32) -> bool {
        let overlaps = frame.header_start() < physical.slot()
            && physical.header_start() < frame.slot();
        let end = frame.slot() + argument_count as usize;

        !overlaps && end <= self.stack.top()
    }

    fn inconsistent_stack_walk(&self, frame: CallFrame, reason: fmt::Arguments<'_>) {
        self.stack.context().note_inconsistent_stack_walk();
        warning!(
            "inconsistent stack walk at frame {}: {}",
            frame.slot(),
            reason
        );
    }
}
