use anyhow::{anyhow, Context};
use pico_args::Arguments;
use rustc_version_runtime::version_meta;
use std::{
    convert::TryFrom,
    env::current_exe,
    io::{self, Write},
    path::PathBuf,
    process::exit,
    sync::Arc,
};
use tessel_log::*;
use tessel_vm::{
    code_unit::{CodeLocation, CodeOrigin, CompiledCode},
    frame::{CallFrame, CallerLink, FrameLocation},
    inline::InlineFrame,
    vm::{
        exception::{ExceptionHandler, Unwinder},
        VMError,
    },
    walker::{backtrace, count_frames, FrameDump},
    Register, StackConfig, StackContext, VM,
};

const PACKAGE_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_DEPTH: usize = 8;

/// Where calls out of the demo code units return to.
const CALL_START: CodeLocation = CodeLocation::new(0x40);
const CALL_RETURN: CodeLocation = CodeLocation::new(0x48);

#[derive(Debug)]
struct Args {
    depth: usize,
    help: bool,
    inline: bool,
    overflow: bool,
    stack_config: StackConfig,
    trace: bool,
    verbose: bool,
    version: bool,
}

fn process_args() -> Result<Args, pico_args::Error> {
    let mut args = Arguments::from_env();
    let option_strings = args.values_from_str(["-S", "--stack-option"])?;
    let stack_config = match StackConfig::try_from(option_strings) {
        Ok(res) => res,

        Err(err) => {
            error!("{}", err);
            exit(1);
        },
    };

    let res = Args {
        depth: args
            .opt_value_from_str(["-d", "--depth"])?
            .unwrap_or(DEFAULT_DEPTH),
        help: args.contains(["-h", "--help"]),
        inline: args.contains(["-i", "--inline"]),
        overflow: args.contains(["-o", "--overflow"]),
        trace: args.contains(["-t", "--trace"]),
        verbose: args.contains(["-v", "--verbose"]),
        version: args.contains(["-V", "--version"]),
        stack_config,
    };

    args.finish()?;
    Ok(res)
}

fn usage() -> String {
    let current_exe = current_exe().unwrap_or_else(|_| PathBuf::from(PACKAGE_NAME));
    let filename = current_exe
        .file_name()
        .map_or_else(|| PACKAGE_NAME.into(), |name| name.to_string_lossy());

    format!(
        concat!(
            "Usage: {} [options]\n",
            "Options:\n",
            "   -d n, --depth n - push n nested frames (default 8)\n",
            "   -h, --help - view help\n",
            "   -i, --inline - run the innermost frame in code with inlined calls\n",
            "   -o, --overflow - keep pushing frames until the stack overflows\n",
            "   -S key=value, --stack-option key=value - configure the stack\n",
            "       (capacity, commit-granularity, max-excess-capacity, backend=os|heap)\n",
            "   -t, --trace - trace every stack operation\n",
            "   -v, --verbose - enable verbose output\n",
            "   -V, --version - show version\n",
        ),
        filename
    )
}

/// Reports every frame it unwinds through, and lets the exception
/// escape to the host.
struct ReportingUnwinder;

impl Unwinder for ReportingUnwinder {
    fn unwind(
        &mut self,
        vm: &mut VM,
        frame: CallFrame,
        exception: Register,
        bytecode_offset: u32,
    ) -> ExceptionHandler {
        info!(
            "unwinding {} from bytecode offset {} through {} frame(s)",
            exception,
            bytecode_offset,
            count_frames(vm.stack(), Some(frame))
        );

        for entry in backtrace(vm, Some(frame)) {
            info!("  at {}", entry);
        }

        ExceptionHandler {
            frame: None,
            location: None,
        }
    }

    fn create_stack_overflow_error(&mut self, vm: &mut VM) -> Register {
        debug!(
            "building stack overflow error ({} slots in use)",
            vm.stack().top()
        );
        Register::from(0x0e70)
    }
}

/// A function with `middle` inlined into it and `inner` inlined into
/// `middle`. Its call out of `inner` is at `CALL_START`.
fn inlined_code() -> CompiledCode {
    let mut code = CompiledCode::new("outer", 64, 32);

    let middle = code.add_inline_frame(InlineFrame {
        callee: Some(Register::from(0x200)),
        scope: None,
        argument_count: 1,
        stack_offset: 12,
        caller: CodeOrigin::new(4),
    });

    let inner = code.add_inline_frame(InlineFrame {
        callee: Some(Register::from(0x300)),
        scope: None,
        argument_count: 0,
        stack_offset: 22,
        caller: CodeOrigin::inlined(9, middle),
    });

    code.add_call_site(CALL_START, CALL_RETURN, CodeOrigin::inlined(2, inner));
    code.capture_origin(CodeOrigin::inlined(2, inner));
    code
}

fn run(args: &Args) -> anyhow::Result<()> {
    let context = StackContext::initialize();
    let mut vm = VM::new(context.clone(), &args.stack_config)
        .context("couldn't set up the virtual machine")?;

    let plain = vm.add_code_unit(Arc::new(CompiledCode::new("f", 16, 4)));
    let mut caller = CallerLink::Host(None);
    let mut pushed = 0;

    while args.overflow || pushed < args.depth {
        match vm.push(caller, Some(plain), Register::EMPTY, 1, Register::from(pushed as u64)) {
            Ok(frame) => {
                vm.stack_mut().header_mut(frame).set_return_location(Some(CALL_RETURN));
                caller = CallerLink::Frame(frame);
                pushed += 1;
            },

            Err(VMError::StackOverflow { top, .. }) if args.overflow => {
                info!("stack overflowed after {} frames ({} slots)", pushed, top);
                let frame = vm
                    .top_call_frame()
                    .ok_or_else(|| anyhow!("the stack overflowed before any frame was pushed"))?;
                vm.throw_stack_overflow(&mut ReportingUnwinder, frame, CALL_RETURN);
                vm.clear_exception();
                break;
            },

            Err(err) => return Err(err).context("couldn't push a frame"),
        }
    }

    if args.inline {
        let outer = vm.add_code_unit(Arc::new(inlined_code()));
        let frame = vm
            .push(caller, Some(outer), Register::EMPTY, 0, Register::from(0x100))
            .context("couldn't push the inlined frame")?;
        vm.stack_mut()
            .header_mut(frame)
            .set_location(Some(FrameLocation::OriginIndex(0)));
        pushed += 1;
    }

    let top = vm.top_call_frame();
    info!(
        "{} frame(s) pushed, {} on the stack",
        pushed,
        count_frames(vm.stack(), top)
    );

    if let Some(frame) = top {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        write!(out, "{}", FrameDump::new(vm.stack(), frame))?;

        writeln!(out, "Backtrace:")?;
        for (i, entry) in backtrace(&mut vm, Some(frame)).iter().enumerate() {
            writeln!(out, "  #{:<3} {}", i, entry)?;
        }
    }

    info!("{} bytes committed", context.committed_byte_count());

    if let Some(frame) = top {
        vm.set_exception(Register::from(0xe));
        vm.return_to_throw(&mut ReportingUnwinder, frame, CALL_RETURN);
        vm.clear_exception();
    }

    let walks = context.inconsistent_stack_walks();
    if walks > 0 {
        warning!("{} inconsistent stack walk(s)", walks);
    }

    drop(vm);
    context
        .teardown()
        .context("stack context still in use at exit")?;
    Ok(())
}

fn main() {
    let args = match process_args() {
        Ok(args) => args,

        Err(pico_args::Error::UnusedArgsLeft(args)) => {
            let s_if_plural = if args.len() == 1 { "" } else { "s" };

            error!("unknown argument{}: {}", s_if_plural, args.join(", "));

            eprintln!("{}", usage());
            exit(1);
        },

        Err(err) => {
            error!("{}", err);
            eprintln!("{}", usage());
            exit(1);
        },
    };

    if args.help {
        println!("{}", usage());
        return;
    } else if args.version || args.verbose {
        println!("{} {}", PACKAGE_NAME, VERSION);

        if args.verbose {
            println!("Compiled with {}", version_meta().short_version_string);
        }

        if args.version {
            return;
        }
    }

    if args.trace {
        set_max_level(Level::Trace);
    } else if args.verbose {
        set_max_level(Level::Debug);
    }

    if let Err(err) = run(&args) {
        error!("{:#}", err);
        exit(2);
    }
}
