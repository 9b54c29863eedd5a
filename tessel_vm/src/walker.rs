//! Looking at frames for debugging.
//!
//! Nothing here is used while running code, and apart from recovering
//! inlined frames for a backtrace, nothing here changes the stack.

use std::{fmt, io};
use tessel_log::*;

use crate::{
    frame::{CallFrame, CallerLink, FrameHeader, FrameLocation, HeaderSlot, HEADER_SIZE},
    inline::InlineFrameId,
    register::Register,
    stack::InterpreterStack,
    vm::VM,
};

const RULE: &str =
    "-----------------------------------------------------------------------------";

/// Most frames `stack` could hold. Walks stop here instead of looping on a
/// corrupt caller chain.
fn frame_limit(stack: &InterpreterStack) -> usize {
    stack.top() / HEADER_SIZE + 1
}

/// Counts `frame` and its callers up to the nearest native caller.
/// Returns -1 if there is no frame.
pub fn count_frames(stack: &InterpreterStack, frame: Option<CallFrame>) -> isize {
    let mut frame = match frame {
        Some(frame) => frame,
        None => return -1,
    };

    let limit = frame_limit(stack);
    let mut count = 1;

    while let Some(caller) = stack.frame(frame).caller_frame() {
        if count as usize >= limit {
            warning!("caller chain through slot {} loops", frame.slot());
            break;
        }

        frame = caller;
        count += 1;
    }

    count
}

pub fn dump_frame(
    stack: &InterpreterStack,
    frame: CallFrame,
    out: &mut impl io::Write,
) -> io::Result<()> {
    write!(out, "{}", FrameDump::new(stack, frame))
}

/// A table of every slot of one frame.
pub struct FrameDump<'stack> {
    stack: &'stack InterpreterStack,
    frame: CallFrame,
}

impl<'stack> FrameDump<'stack> {
    pub fn new(stack: &'stack InterpreterStack, frame: CallFrame) -> Self {
        Self { stack, frame }
    }

    fn row(
        &self,
        f: &mut fmt::Formatter<'_>,
        name: &dyn fmt::Display,
        slot: usize,
        value: Register,
        meaning: &dyn fmt::Display,
    ) -> fmt::Result {
        writeln!(
            f,
            "{:<26} | {:>18p} | {:<18} {}",
            format!("[{}]", name),
            self.stack.address_of(slot),
            value,
            meaning
        )
    }
}

fn describe_header_slot(header: &FrameHeader, slot: HeaderSlot) -> String {
    match slot {
        HeaderSlot::CodeUnit => header
            .code_unit()
            .map_or_else(|| "none".to_string(), |id| id.to_string()),
        HeaderSlot::CallerFrame => {
            let link = match header.caller_link() {
                CallerLink::Frame(frame) => format!("frame at slot {}", frame.slot()),
                CallerLink::Host(Some(frame)) => format!("host, from slot {}", frame.slot()),
                CallerLink::Host(None) => "host".to_string(),
            };

            if header.is_inlined() {
                format!("{} (inlined)", link)
            } else {
                link
            }
        },
        HeaderSlot::ReturnLocation => match (header.inline_frame(), header.return_location()) {
            (Some(id), _) => id.to_string(),
            (None, Some(location)) => location.to_string(),
            (None, None) => "none".to_string(),
        },
        HeaderSlot::ArgumentCount => format!(
            "{} argument(s), {} local(s)",
            header.argument_count(),
            header.local_register_count()
        ),
        HeaderSlot::Location => match header.location() {
            Some(FrameLocation::OriginIndex(index)) => format!("origin #{}", index),
            Some(FrameLocation::BytecodeOffset(offset)) => format!("bytecode {}", offset),
            None => "none".to_string(),
        },
        HeaderSlot::Scope | HeaderSlot::Callee => String::new(),
    }
}

impl fmt::Display for FrameDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.stack.frame(self.frame);
        let header = frame.header();
        let fp = self.frame.slot();

        writeln!(f, "Frame at slot {}:", fp)?;
        writeln!(f)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "{:^26} | {:^18} | value", "use", "address")?;
        writeln!(f, "{}", RULE)?;

        for slot in HeaderSlot::all() {
            let index = (fp as isize + slot.offset()) as usize;
            let meaning = describe_header_slot(header, slot);
            self.row(f, &slot, index, header.raw(slot), &meaning)?;
        }

        writeln!(f, "{}", RULE)?;

        for i in 0..header.argument_count() {
            let name = format!("arg {}", i);
            self.row(f, &name, fp + i as usize, frame.argument(i), &"")?;
        }

        writeln!(f, "{}", RULE)?;

        let locals = fp + header.argument_count() as usize;
        for i in 0..header.local_register_count() {
            let name = format!("r{:<2}", i);
            self.row(f, &name, locals + i as usize, frame.register(i), &"")?;
        }

        writeln!(f, "{}", RULE)
    }
}

/// One logical frame in a backtrace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BacktraceEntry {
    pub frame: CallFrame,
    /// Name of the code unit the frame runs, if any.
    pub code_unit: Option<String>,
    pub inline_frame: Option<InlineFrameId>,
    pub bytecode_offset: Option<u32>,
    pub callee: Option<Register>,
}

impl BacktraceEntry {
    pub fn is_inlined(&self) -> bool {
        self.inline_frame.is_some()
    }
}

impl fmt::Display for BacktraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code_unit {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "<native>")?,
        }

        if let Some(id) = self.inline_frame {
            write!(f, " [{}]", id)?;
        }

        if let Some(offset) = self.bytecode_offset {
            write!(f, " at bytecode {}", offset)?;
        }

        write!(f, " (frame at slot {})", self.frame.slot())
    }
}

/// Lists the logical frames from `frame` outwards, inlined ones included.
pub fn backtrace(vm: &mut VM, frame: Option<CallFrame>) -> Vec<BacktraceEntry> {
    let mut entries = Vec::new();
    let limit = frame_limit(vm.stack());

    // Only a captured origin index says where the top frame stopped, so
    // without one it's listed as it is.
    let mut current = match frame {
        Some(frame) => {
            let location = vm.frame(frame).location();
            match location {
                Some(FrameLocation::OriginIndex(_)) => vm.true_frame(frame, None).or(Some(frame)),
                _ => Some(frame),
            }
        },
        None => None,
    };
    let mut callee: Option<CallFrame> = None;

    while let Some(frame) = current {
        if entries.len() >= limit {
            break;
        }

        entries.push(entry(vm, frame, callee));
        callee = Some(frame);
        current = vm.true_caller_frame(frame);
    }

    entries
}

fn entry(vm: &VM, frame: CallFrame, callee: Option<CallFrame>) -> BacktraceEntry {
    let view = vm.frame(frame);
    let code = vm.code_unit_of(frame);

    BacktraceEntry {
        frame,
        code_unit: code.as_ref().map(|code| code.name().to_string()),
        inline_frame: view.inline_frame(),
        bytecode_offset: bytecode_offset(vm, frame, callee),
        callee: view.callee(),
    }
}

/// Where `frame` is stopped in its logical function. `callee` is the
/// frame it called, if the walk came from there.
fn bytecode_offset(vm: &VM, frame: CallFrame, callee: Option<CallFrame>) -> Option<u32> {
    let view = vm.frame(frame);

    if view.is_inlined() {
        return match view.location()? {
            FrameLocation::BytecodeOffset(offset) => Some(offset),
            FrameLocation::OriginIndex(_) => None,
        };
    }

    let code = vm.code_unit_of(frame)?;

    if let Some(callee) = callee.map(|callee| vm.frame(callee)) {
        if let Some(id) = callee.inline_frame() {
            return code
                .inline_frames()
                .get(id)
                .map(|inlined| inlined.caller.bytecode_index);
        }

        if let Some(location) = callee.return_location() {
            return code
                .code_origin_for_return(location)
                .map(|origin| origin.bytecode_index);
        }
    }

    match view.location()? {
        FrameLocation::OriginIndex(index) => code
            .code_origin_at_index(index)
            .map(|origin| origin.bytecode_index),
        FrameLocation::BytecodeOffset(offset) => Some(offset),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        code_unit::{CodeLocation, CodeOrigin, CompiledCode},
        config::{MemoryBackend, StackConfig},
        context::StackContext,
        inline::InlineFrame,
    };

    fn vm() -> VM {
        let config = StackConfig::new(512, 128, 0, MemoryBackend::Heap);
        VM::new(StackContext::initialize(), &config).expect("Expected a VM")
    }

    fn push(vm: &mut VM, caller: CallerLink, name: &str) -> CallFrame {
        let code = vm.add_code_unit(Arc::new(CompiledCode::new(name, 4, 1)));
        vm.push(caller, Some(code), Register::EMPTY, 1, Register::from(0xf))
            .unwrap()
    }

    #[test]
    fn count_no_frame() {
        let vm = vm();
        assert_eq!(count_frames(vm.stack(), None), -1);
    }

    #[test]
    fn count_stops_at_host_boundary() {
        let mut vm = vm();
        let a = push(&mut vm, CallerLink::Host(None), "a");
        let b = push(&mut vm, CallerLink::Frame(a), "b");
        let c = push(&mut vm, CallerLink::Host(Some(b)), "c");
        let d = push(&mut vm, CallerLink::Frame(c), "d");

        assert_eq!(count_frames(vm.stack(), Some(a)), 1);
        assert_eq!(count_frames(vm.stack(), Some(b)), 2);
        assert_eq!(count_frames(vm.stack(), Some(d)), 2);
    }

    #[test]
    fn nested_calls_resolve_in_order() {
        let mut vm = vm();
        let a = push(&mut vm, CallerLink::Host(None), "a");
        let b = push(&mut vm, CallerLink::Frame(a), "b");
        let c = push(&mut vm, CallerLink::Frame(b), "c");

        assert_eq!(vm.true_caller_frame(c), Some(b));
        assert_eq!(vm.true_caller_frame(b), Some(a));
        assert_eq!(vm.true_caller_frame(a), None);
        assert_eq!(count_frames(vm.stack(), Some(c)), 3);

        let names: Vec<_> = backtrace(&mut vm, Some(c))
            .into_iter()
            .map(|entry| entry.code_unit.unwrap())
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[test]
    fn dump_lists_every_slot() {
        let mut vm = vm();
        let frame = push(&mut vm, CallerLink::Host(None), "a");
        vm.stack_mut().set_argument(frame, 0, Register::from(0xabc));

        let mut out = Vec::new();
        dump_frame(vm.stack(), frame, &mut out).unwrap();
        let dump = String::from_utf8(out).unwrap();

        for slot in HeaderSlot::all() {
            assert!(dump.contains(&format!("[{}]", slot)));
        }

        assert!(dump.contains("[arg 0]"));
        assert!(dump.contains(&Register::from(0xabc).to_string()));
        assert!(dump.contains("[r0 ]"));
        assert!(dump.contains("1 argument(s), 1 local(s)"));
        assert!(dump.contains("host"));
    }

    #[test]
    fn dump_leaves_stack_alone() {
        let mut vm = vm();
        let frame = push(&mut vm, CallerLink::Host(None), "a");
        let top = vm.stack().top();
        let header = *vm.stack().header(frame);

        let _ = FrameDump::new(vm.stack(), frame).to_string();

        assert_eq!(vm.stack().top(), top);
        for slot in HeaderSlot::all() {
            assert_eq!(vm.stack().header(frame).raw(slot), header.raw(slot));
        }
    }

    #[test]
    fn backtrace_through_inlined_frames() {
        let mut vm = vm();
        let mut code = CompiledCode::new("outer", 32, 20);
        let middle = code.add_inline_frame(InlineFrame {
            callee: Some(Register::from(0x200)),
            scope: None,
            argument_count: 0,
            stack_offset: 8,
            caller: CodeOrigin::new(5),
        });
        let inner = code.add_inline_frame(InlineFrame {
            callee: Some(Register::from(0x300)),
            scope: None,
            argument_count: 0,
            stack_offset: 15,
            caller: CodeOrigin::inlined(8, middle),
        });
        let index = code.capture_origin(CodeOrigin::inlined(3, inner));
        code.add_call_site(
            CodeLocation::new(0x10),
            CodeLocation::new(0x18),
            CodeOrigin::new(1),
        );

        let outer = vm.add_code_unit(Arc::new(code));
        let entry = push(&mut vm, CallerLink::Host(None), "entry");
        let physical = vm
            .push(CallerLink::Frame(entry), Some(outer), Register::EMPTY, 0, Register::from(0x100))
            .unwrap();
        vm.stack_mut()
            .header_mut(physical)
            .set_location(Some(FrameLocation::OriginIndex(index)));

        let trace = backtrace(&mut vm, Some(physical));
        let summary: Vec<_> = trace
            .iter()
            .map(|entry| (entry.code_unit.clone().unwrap(), entry.bytecode_offset, entry.is_inlined()))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("outer".to_string(), Some(3), true),
                ("outer".to_string(), Some(8), true),
                ("outer".to_string(), Some(5), false),
                ("entry".to_string(), None, false),
            ]
        );
        assert_eq!(trace[0].callee, Some(Register::from(0x300)));
        assert_eq!(trace[2].frame, physical);
        assert!(trace[0].to_string().starts_with("outer [inline#1] at bytecode 3"));
    }

    #[test]
    fn backtrace_without_captured_origin() {
        let mut vm = vm();
        let mut code = CompiledCode::new("outer", 32, 20);
        let inlined = code.add_inline_frame(InlineFrame {
            callee: None,
            scope: None,
            argument_count: 0,
            stack_offset: 8,
            caller: CodeOrigin::new(2),
        });
        code.capture_origin(CodeOrigin::inlined(1, inlined));

        let outer = vm.add_code_unit(Arc::new(code));
        let entry = push(&mut vm, CallerLink::Host(None), "entry");
        let physical = vm
            .push(CallerLink::Frame(entry), Some(outer), Register::EMPTY, 0, Register::EMPTY)
            .unwrap();

        // Still in its prologue, so nothing has been captured yet.
        let trace = backtrace(&mut vm, Some(physical));

        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].frame, physical);
        assert!(!trace[0].is_inlined());
        assert_eq!(trace[1].frame, entry);
        assert_eq!(vm.context().inconsistent_stack_walks(), 0);
    }
}
