//! Execution frames.
//!
//! A frame is a window over the stack. Its frame pointer is the slot just
//! past a fixed seven-slot header; arguments and then locals follow:
//!
//! ```none
//!  fp-7       fp-6   fp-5     fp-4        fp-3       fp-2      fp-1    fp        fp+argc
//! [code unit][scope][caller][return loc][arg count][location][callee][args...][locals...]
//! ```
//!
//! Frames are never owned. A [`CallFrame`] is just the position of a frame
//! pointer and stays meaningful only while the frame is pushed.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::{fmt, mem};

use crate::{
    code_unit::{CodeLocation, CodeUnitId},
    inline::InlineFrameId,
    register::Register,
    stack::InterpreterStack,
    FrameTags,
};

/// Number of header slots below every frame pointer.
pub const HEADER_SIZE: usize = 7;

const TAG_BITS: u64 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

const LOCATION_ORIGIN_INDEX: u64 = 0b01;
const LOCATION_BYTECODE_OFFSET: u64 = 0b10;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq, ToPrimitive)]
pub enum HeaderSlot {
    CodeUnit,
    Scope,
    CallerFrame,
    ReturnLocation,
    ArgumentCount,
    Location,
    Callee,
}

impl HeaderSlot {
    /// Offset of this slot from the frame pointer.
    pub const fn offset(self) -> isize {
        self as isize - HEADER_SIZE as isize
    }

    pub fn all() -> impl Iterator<Item = HeaderSlot> {
        (0..HEADER_SIZE).filter_map(HeaderSlot::from_usize)
    }
}

impl fmt::Display for HeaderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderSlot::CodeUnit => write!(f, "CodeUnit"),
            HeaderSlot::Scope => write!(f, "Scope"),
            HeaderSlot::CallerFrame => write!(f, "CallerFrame"),
            HeaderSlot::ReturnLocation => write!(f, "ReturnLocation"),
            HeaderSlot::ArgumentCount => write!(f, "ArgumentCount"),
            HeaderSlot::Location => write!(f, "Location"),
            HeaderSlot::Callee => write!(f, "Callee"),
        }
    }
}

/// The position of a frame's frame pointer on its stack.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CallFrame(usize);

impl CallFrame {
    pub(crate) const fn new(frame_pointer: usize) -> Self {
        Self(frame_pointer)
    }

    /// Slot index of the frame pointer.
    pub const fn slot(self) -> usize {
        self.0
    }

    /// Slot index of the first header slot.
    pub const fn header_start(self) -> usize {
        self.0 - HEADER_SIZE
    }

    /// The frame whose frame pointer is `delta` slots away from this one,
    /// if that leaves room for a header.
    pub(crate) fn offset_by(self, delta: i32) -> Option<CallFrame> {
        let slot = if delta < 0 {
            self.0.checked_sub(delta.unsigned_abs() as usize)?
        } else {
            self.0.checked_add(delta as usize)?
        };

        if slot < HEADER_SIZE {
            None
        } else {
            Some(CallFrame(slot))
        }
    }
}

/// Who called a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallerLink {
    /// Another frame on the same stack.
    Frame(CallFrame),
    /// Native code. If the native code was itself called from the
    /// interpreter, the interpreter frame it was called from is kept.
    Host(Option<CallFrame>),
}

impl CallerLink {
    fn encode(self, tags: FrameTags) -> Register {
        let (frame, tags) = match self {
            CallerLink::Frame(frame) => (Some(frame), tags),
            CallerLink::Host(frame) => (frame, tags | FrameTags::HOST_BOUNDARY),
        };

        let payload = frame.map_or(0, |frame| frame.slot() as u64 + 1);
        Register::from_bits((payload << TAG_BITS) | tags.bits())
    }

    fn decode(register: Register) -> (Self, FrameTags) {
        let tags = FrameTags::from_bits_truncate(register.bits() & TAG_MASK);
        let frame = match register.bits() >> TAG_BITS {
            0 => None,
            payload => Some(CallFrame((payload - 1) as usize)),
        };

        if tags.contains(FrameTags::HOST_BOUNDARY) {
            (CallerLink::Host(frame), tags)
        } else {
            match frame {
                Some(frame) => (CallerLink::Frame(frame), tags),
                // An untagged empty link only appears in a cleared header.
                None => (CallerLink::Host(None), tags | FrameTags::HOST_BOUNDARY),
            }
        }
    }
}

/// What a frame's location slot holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameLocation {
    /// Index into the code unit's captured origins, stored by machine
    /// code before it leaves for the runtime.
    OriginIndex(u32),
    /// A bytecode offset in the frame's logical function.
    BytecodeOffset(u32),
}

/// The seven header slots of a frame, overlaid on the stack.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    code_unit: Register,
    scope: Register,
    caller_frame: Register,
    return_location: Register,
    argument_count: Register,
    location: Register,
    callee: Register,
}

const _: () = assert!(mem::size_of::<FrameHeader>() == HEADER_SIZE * Register::SIZE);

impl FrameHeader {
    pub fn code_unit(&self) -> Option<CodeUnitId> {
        match self.code_unit.bits() {
            0 => None,
            id => Some(CodeUnitId::new((id - 1) as u32)),
        }
    }

    pub fn set_code_unit(&mut self, code_unit: Option<CodeUnitId>) {
        self.code_unit = Register::from_bits(code_unit.map_or(0, |id| id.index() as u64 + 1));
    }

    pub fn scope(&self) -> Register {
        self.scope
    }

    pub fn set_scope(&mut self, scope: Register) {
        self.scope = scope;
    }

    pub fn caller_link(&self) -> CallerLink {
        CallerLink::decode(self.caller_frame).0
    }

    pub fn tags(&self) -> FrameTags {
        CallerLink::decode(self.caller_frame).1
    }

    pub fn set_caller(&mut self, caller: CallerLink, tags: FrameTags) {
        self.caller_frame = caller.encode(tags);
    }

    pub fn is_inlined(&self) -> bool {
        self.tags().contains(FrameTags::INLINED)
    }

    /// Where the caller resumes when this frame returns. Synthetic inlined
    /// frames have no machine return location.
    pub fn return_location(&self) -> Option<CodeLocation> {
        if self.is_inlined() {
            return None;
        }

        match self.return_location.bits() {
            0 => None,
            location => Some(CodeLocation::new(location - 1)),
        }
    }

    pub fn set_return_location(&mut self, location: Option<CodeLocation>) {
        self.return_location = Register::from_bits(location.map_or(0, |l| l.offset() + 1));
    }

    /// The inline descriptor a synthetic frame was built from.
    pub fn inline_frame(&self) -> Option<InlineFrameId> {
        if !self.is_inlined() {
            return None;
        }

        match self.return_location.bits() {
            0 => None,
            id => Some(InlineFrameId::new((id - 1) as u32)),
        }
    }

    pub(crate) fn set_inline_frame(&mut self, id: InlineFrameId) {
        self.return_location = Register::from_bits(id.index() as u64 + 1);
    }

    pub fn argument_count(&self) -> u32 {
        self.argument_count.bits() as u32
    }

    /// Number of locals declared by the frame's code unit.
    pub fn local_register_count(&self) -> u32 {
        (self.argument_count.bits() >> 32) as u32
    }

    pub fn set_argument_count(&mut self, argument_count: u32, local_registers: u32) {
        self.argument_count =
            Register::from_bits(argument_count as u64 | (local_registers as u64) << 32);
    }

    pub fn location(&self) -> Option<FrameLocation> {
        let value = (self.location.bits() >> TAG_BITS) as u32;

        match self.location.bits() & TAG_MASK {
            LOCATION_ORIGIN_INDEX => Some(FrameLocation::OriginIndex(value)),
            LOCATION_BYTECODE_OFFSET => Some(FrameLocation::BytecodeOffset(value)),
            _ => None,
        }
    }

    pub fn set_location(&mut self, location: Option<FrameLocation>) {
        let bits = match location {
            None => 0,
            Some(FrameLocation::OriginIndex(index)) => {
                (index as u64) << TAG_BITS | LOCATION_ORIGIN_INDEX
            },
            Some(FrameLocation::BytecodeOffset(offset)) => {
                (offset as u64) << TAG_BITS | LOCATION_BYTECODE_OFFSET
            },
        };

        self.location = Register::from_bits(bits);
    }

    pub fn callee(&self) -> Option<Register> {
        self.callee.non_empty()
    }

    pub fn set_callee(&mut self, callee: Register) {
        self.callee = callee;
    }

    /// The raw contents of one header slot.
    pub fn raw(&self, slot: HeaderSlot) -> Register {
        match slot {
            HeaderSlot::CodeUnit => self.code_unit,
            HeaderSlot::Scope => self.scope,
            HeaderSlot::CallerFrame => self.caller_frame,
            HeaderSlot::ReturnLocation => self.return_location,
            HeaderSlot::ArgumentCount => self.argument_count,
            HeaderSlot::Location => self.location,
            HeaderSlot::Callee => self.callee,
        }
    }
}

/// What a code unit tells the stack when pushing a frame for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CodeRef {
    pub id: CodeUnitId,
    pub local_registers: u32,
}

/// A read-only view of one frame.
#[derive(Clone, Copy)]
pub struct Frame<'stack> {
    stack: &'stack InterpreterStack,
    frame: CallFrame,
}

impl<'stack> Frame<'stack> {
    pub fn handle(&self) -> CallFrame {
        self.frame
    }

    pub fn header(&self) -> &'stack FrameHeader {
        self.stack.header(self.frame)
    }

    pub fn code_unit(&self) -> Option<CodeUnitId> {
        self.header().code_unit()
    }

    pub fn scope(&self) -> Register {
        self.header().scope()
    }

    pub fn caller_link(&self) -> CallerLink {
        self.header().caller_link()
    }

    /// The calling frame, or `None` if this frame was called from native code.
    pub fn caller_frame(&self) -> Option<CallFrame> {
        match self.caller_link() {
            CallerLink::Frame(frame) => Some(frame),
            CallerLink::Host(_) => None,
        }
    }

    pub fn has_host_caller(&self) -> bool {
        self.header().tags().contains(FrameTags::HOST_BOUNDARY)
    }

    pub fn is_inlined(&self) -> bool {
        self.header().is_inlined()
    }

    pub fn return_location(&self) -> Option<CodeLocation> {
        self.header().return_location()
    }

    pub fn inline_frame(&self) -> Option<InlineFrameId> {
        self.header().inline_frame()
    }

    pub fn argument_count(&self) -> u32 {
        self.header().argument_count()
    }

    pub fn location(&self) -> Option<FrameLocation> {
        self.header().location()
    }

    pub fn callee(&self) -> Option<Register> {
        self.header().callee()
    }

    pub fn argument(&self, index: u32) -> Register {
        debug_assert!(index < self.argument_count());
        self.stack.slot(self.frame.slot() + index as usize)
    }

    pub fn register(&self, index: u32) -> Register {
        debug_assert!(index < self.header().local_register_count());
        self.stack
            .slot(self.frame.slot() + self.argument_count() as usize + index as usize)
    }

    /// The slot just past this frame's locals.
    pub fn frame_extent(&self) -> usize {
        let header = self.header();
        self.frame.slot()
            + header.argument_count() as usize
            + header.local_register_count() as usize
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame", &self.frame)
            .field("header", self.header())
            .finish()
    }
}

impl InterpreterStack {
    pub fn frame(&self, frame: CallFrame) -> Frame<'_> {
        Frame { stack: self, frame }
    }

    pub fn header(&self, frame: CallFrame) -> &FrameHeader {
        debug_assert!(
            frame.slot() <= self.top(),
            "frame {:?} lies above the top of the stack ({})",
            frame,
            self.top()
        );

        let slots = self.slots(frame.header_start()..frame.slot());
        // `FrameHeader` is `repr(C)` over exactly `HEADER_SIZE` registers.
        unsafe { &*(slots.as_ptr() as *const FrameHeader) }
    }

    pub fn header_mut(&mut self, frame: CallFrame) -> &mut FrameHeader {
        debug_assert!(
            frame.slot() <= self.top(),
            "frame {:?} lies above the top of the stack ({})",
            frame,
            self.top()
        );

        let slots = self.slots_mut(frame.header_start()..frame.slot());
        unsafe { &mut *(slots.as_mut_ptr() as *mut FrameHeader) }
    }

    /// Pushes a frame directly above its caller, or at the top of the
    /// stack when entering from native code.
    ///
    /// Returns `None`, writing nothing, if the stack can't grow enough.
    pub fn push(
        &mut self,
        caller: CallerLink,
        code: Option<CodeRef>,
        scope: Register,
        argument_count: u32,
        callee: Register,
    ) -> Option<CallFrame> {
        let base = match caller {
            CallerLink::Frame(caller) => self.frame(caller).frame_extent(),
            CallerLink::Host(_) => self.top(),
        };

        let local_registers = code.map_or(0, |code| code.local_registers);
        let frame = CallFrame::new(base + HEADER_SIZE);
        let end = frame.slot() + argument_count as usize + local_registers as usize;

        if !self.grow(end) {
            return None;
        }

        let header = self.header_mut(frame);
        header.set_code_unit(code.map(|code| code.id));
        header.set_scope(scope);
        header.set_caller(caller, FrameTags::empty());
        header.set_return_location(None);
        header.set_argument_count(argument_count, local_registers);
        header.set_location(None);
        header.set_callee(callee);

        for slot in self.slots_mut(frame.slot()..end) {
            *slot = Register::EMPTY;
        }

        Some(frame)
    }

    /// Pops `frame` and everything above it.
    pub fn pop(&mut self, frame: CallFrame) {
        self.shrink(frame.header_start());
    }

    pub fn set_argument(&mut self, frame: CallFrame, index: u32, value: Register) {
        debug_assert!(index < self.frame(frame).argument_count());
        self.set_slot(frame.slot() + index as usize, value);
    }

    pub fn set_register(&mut self, frame: CallFrame, index: u32, value: Register) {
        let header = self.header(frame);
        debug_assert!(index < header.local_register_count());
        let slot = frame.slot() + header.argument_count() as usize + index as usize;
        self.set_slot(slot, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{MemoryBackend, StackConfig},
        context::StackContext,
    };

    fn stack() -> InterpreterStack {
        let config = StackConfig::new(1024, 128, 0, MemoryBackend::Heap);
        InterpreterStack::new(StackContext::initialize(), &config).unwrap()
    }

    fn code(id: u32, local_registers: u32) -> Option<CodeRef> {
        Some(CodeRef {
            id: CodeUnitId::new(id),
            local_registers,
        })
    }

    #[test]
    fn header_slot_offsets() {
        let offsets: Vec<_> = HeaderSlot::all().map(HeaderSlot::offset).collect();
        assert_eq!(offsets, vec![-7, -6, -5, -4, -3, -2, -1]);
        assert_eq!(HeaderSlot::Callee.to_string(), "Callee");
    }

    #[test]
    fn push_writes_header() {
        let mut stack = stack();
        let entry = stack
            .push(CallerLink::Host(None), code(3, 4), Register::from(0x10), 2, Register::from(0x20))
            .expect("Expected a push");

        assert_eq!(entry.slot(), HEADER_SIZE);
        assert_eq!(stack.top(), HEADER_SIZE + 2 + 4);

        let frame = stack.frame(entry);
        assert_eq!(frame.code_unit(), Some(CodeUnitId::new(3)));
        assert_eq!(frame.scope(), Register::from(0x10));
        assert_eq!(frame.callee(), Some(Register::from(0x20)));
        assert_eq!(frame.argument_count(), 2);
        assert_eq!(frame.caller_frame(), None);
        assert!(frame.has_host_caller());
        assert!(!frame.is_inlined());
        assert_eq!(frame.return_location(), None);
        assert_eq!(frame.location(), None);
        assert_eq!(frame.frame_extent(), stack.top());
    }

    #[test]
    fn push_above_caller() {
        let mut stack = stack();
        let entry = stack
            .push(CallerLink::Host(None), code(0, 3), Register::EMPTY, 1, Register::EMPTY)
            .unwrap();
        let callee = stack
            .push(CallerLink::Frame(entry), None, Register::EMPTY, 0, Register::EMPTY)
            .unwrap();

        assert_eq!(callee.header_start(), stack.frame(entry).frame_extent());
        assert_eq!(stack.frame(callee).caller_frame(), Some(entry));
        assert_eq!(stack.frame(callee).code_unit(), None);

        stack.pop(callee);
        assert_eq!(stack.top(), stack.frame(entry).frame_extent());
        stack.pop(entry);
        assert!(stack.is_empty());
    }

    #[test]
    fn host_boundary_keeps_native_caller() {
        let mut stack = stack();
        let entry = stack
            .push(CallerLink::Host(None), None, Register::EMPTY, 0, Register::EMPTY)
            .unwrap();
        let reentry = stack
            .push(CallerLink::Host(Some(entry)), None, Register::EMPTY, 0, Register::EMPTY)
            .unwrap();

        let frame = stack.frame(reentry);
        assert_eq!(frame.caller_frame(), None);
        assert_eq!(frame.caller_link(), CallerLink::Host(Some(entry)));
    }

    #[test]
    fn arguments_and_registers() {
        let mut stack = stack();
        let frame = stack
            .push(CallerLink::Host(None), code(0, 2), Register::EMPTY, 2, Register::EMPTY)
            .unwrap();

        stack.set_argument(frame, 0, Register::from(1));
        stack.set_argument(frame, 1, Register::from(2));
        stack.set_register(frame, 0, Register::from(3));
        stack.set_register(frame, 1, Register::from(4));

        let view = stack.frame(frame);
        assert_eq!(view.argument(1), Register::from(2));
        assert_eq!(view.register(0), Register::from(3));
        assert_eq!(view.register(1), Register::from(4));
    }

    #[test]
    fn push_clears_stale_slots() {
        let mut stack = stack();
        let frame = stack
            .push(CallerLink::Host(None), code(0, 1), Register::EMPTY, 0, Register::EMPTY)
            .unwrap();
        stack.set_register(frame, 0, Register::from(0xdead));
        stack.pop(frame);

        let frame = stack
            .push(CallerLink::Host(None), code(0, 1), Register::EMPTY, 0, Register::EMPTY)
            .unwrap();
        assert_eq!(stack.frame(frame).register(0), Register::EMPTY);
    }

    #[test]
    fn failed_push_writes_nothing() {
        let mut stack = stack();
        let top = stack.top();
        let commit_end = stack.commit_end();

        let res = stack.push(
            CallerLink::Host(None),
            code(0, 4096),
            Register::EMPTY,
            0,
            Register::EMPTY,
        );

        assert_eq!(res, None);
        assert_eq!(stack.top(), top);
        assert_eq!(stack.commit_end(), commit_end);
    }

    #[test]
    fn locations_round_trip_through_tags() {
        let mut stack = stack();
        let frame = stack
            .push(CallerLink::Host(None), None, Register::EMPTY, 0, Register::EMPTY)
            .unwrap();

        let header = stack.header_mut(frame);
        header.set_location(Some(FrameLocation::OriginIndex(9)));
        header.set_return_location(Some(CodeLocation::new(0x40)));
        assert_eq!(header.location(), Some(FrameLocation::OriginIndex(9)));
        assert_eq!(header.return_location(), Some(CodeLocation::new(0x40)));
        assert_eq!(header.inline_frame(), None);

        header.set_caller(CallerLink::Host(None), FrameTags::INLINED);
        header.set_inline_frame(InlineFrameId::new(5));
        header.set_location(Some(FrameLocation::BytecodeOffset(12)));
        assert_eq!(header.return_location(), None);
        assert_eq!(header.inline_frame(), Some(InlineFrameId::new(5)));
        assert_eq!(header.location(), Some(FrameLocation::BytecodeOffset(12)));
    }

    #[test]
    fn offset_by_needs_header_room() {
        let frame = CallFrame::new(10);
        assert_eq!(frame.offset_by(5), Some(CallFrame::new(15)));
        assert_eq!(frame.offset_by(-3), Some(CallFrame::new(7)));
        assert_eq!(frame.offset_by(-4), None);
        assert_eq!(frame.offset_by(-11), None);
    }
}
