// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Debugger scripts.
//!
//! A transcript is produced by running [`main_script`] in a debugger
//! session, after [`INIT_SCRIPT`] has probed whether the dump holds a
//! WOW64 process. When that transcript has no usable exception record,
//! [`select_recovery_script`] picks a script that asks the debugger to
//! print the record from memory a frame on the stack points at. The
//! output of that second session has no section markers and is read
//! with [`dumplog::parse_exception_record`].
//!
//! Every script writes its output to `[LOG_FILE]`; substituting the path
//! is left to whoever launches the debugger.

use std::fmt;

use dumplog::utils::is_nonzero_address;
use dumplog::{PointerWidth, StackFrame, ThreadRecord};
use serde::Serialize;
use tracing::{debug, trace};

/// The placeholder for the debugger's output file in every script.
pub const LOG_FILE_PLACEHOLDER: &str = "[LOG_FILE]";

const LOG_OPEN: &str = ".logopen /u \"[LOG_FILE]\"\n||\n";
const LOG_CLOSE: &str = ".logclose\n";

/// Probes the dump's bitness before the main script runs.
pub const INIT_SCRIPT: &str = ".logopen /u \"[LOG_FILE]\"
||
.foreach (module {lm1m} ) { .if ($sicmp(\"${module}\",\"wow64\") == 0) { .echo WOW64 found; } }
.effmach
.logclose
";

const MAIN_SCRIPT_BODY: &str = ".lines -e
.foreach (module {lm1m} ) { .if ($sicmp(\"${module}\",\"wow64\") == 0) { .echo WOW64 found; .effmach x86; } }
.effmach
.cordll -ve -u -l
.chain
.echo > !eeversion
!eeversion
.echo >>> TARGET INFO
!envvar COMPUTERNAME
!envvar USERNAME
.echo PROCESS_ID:
|.
.echo TARGET:
vertarget
!peb
.echo >>> MANAGED THREADS
!Threads
.echo >>> MANAGED STACKS
.block { ~* e !clrstack }
.echo >>> EXCEPTION RECORD
.exr -1
.echo >>> INSTRUCTION POINTERS
.block { ~* e ? [INSTRUCT_PTR] }
.echo >>> THREAD STACKS
~* kv n
.echo >>> LOADED MODULES
lmov
.echo >>> END OF LOG
";

const UNHANDLED_EXCEPTION_FILTER_BODY: &str = ".block { .effmach x86 }
.lines -e
~[NUM_THREAD]s
r @$t0 = 0;
.foreach(value {dd [FIRST_PARAM]}){ .if (@$t0 == 1) { .exr value }; .if (@$t0 == 2) { .cxr value }; r @$t0 = @$t0 + 1; }
";

const KI_USER_EXCEPTION_DISPATCH_BODY: &str =
    ".exr [CHILD_SP] + @@c++(sizeof(ntdll!_CONTEXT)) + 0x20\n";

const WERP_REPORT_FAULT_BODY: &str = ".exr poi([FOURTH_PARAM])
.cxr poi([FOURTH_PARAM] + 8)
";

const RTL_DISPATCH_EXCEPTION_BODY: &str = ".exr [THIRD_PARAM]\n";

/// The script that produces a transcript, with the instruction pointer
/// register of the dump's architecture.
pub fn main_script(width: PointerWidth) -> String {
    let register = match width {
        PointerWidth::Bits32 => "@eip",
        PointerWidth::Bits64 => "@rip",
    };
    wrap(&MAIN_SCRIPT_BODY.replace("[INSTRUCT_PTR]", register))
}

fn wrap(body: &str) -> String {
    format!("{LOG_OPEN}{body}{LOG_CLOSE}")
}

/// Where on the stack a recovery script finds the exception record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecoveryStrategy {
    /// The first argument of `UnhandledExceptionFilter` points at the
    /// exception and context record pointers (32-bit).
    UnhandledExceptionFilter,
    /// The record sits above the `KiUserExceptionDispatch` frame's
    /// context (64-bit).
    KiUserExceptionDispatch,
    /// The fourth argument of `WerpReportFault` points at the exception
    /// pointers (64-bit).
    WerpReportFault,
    /// The third argument of `RtlDispatchException` is the record.
    RtlDispatchException,
}

impl RecoveryStrategy {
    /// The function whose frame the strategy reads.
    pub fn keyword(self) -> &'static str {
        match self {
            RecoveryStrategy::UnhandledExceptionFilter => "UnhandledExceptionFilter",
            RecoveryStrategy::KiUserExceptionDispatch => "KiUserExceptionDispatch",
            RecoveryStrategy::WerpReportFault => "WerpReportFault",
            RecoveryStrategy::RtlDispatchException => "RtlDispatchException",
        }
    }

    /// The strategies to try for a dump of `width`, in order.
    pub fn candidates(width: PointerWidth) -> &'static [RecoveryStrategy] {
        match width {
            PointerWidth::Bits32 => &[
                RecoveryStrategy::UnhandledExceptionFilter,
                RecoveryStrategy::RtlDispatchException,
            ],
            PointerWidth::Bits64 => &[
                RecoveryStrategy::KiUserExceptionDispatch,
                RecoveryStrategy::WerpReportFault,
                RecoveryStrategy::RtlDispatchException,
            ],
        }
    }

    // The value the script is parameterized with.
    fn argument(self, frame: &StackFrame) -> Option<&str> {
        match self {
            RecoveryStrategy::UnhandledExceptionFilter => frame.arg(1),
            RecoveryStrategy::KiUserExceptionDispatch => frame.child_sp.as_deref(),
            RecoveryStrategy::WerpReportFault => frame.arg(4),
            RecoveryStrategy::RtlDispatchException => frame.arg(3),
        }
    }

    fn script(self, thread: usize, argument: &str) -> String {
        let body = match self {
            RecoveryStrategy::UnhandledExceptionFilter => UNHANDLED_EXCEPTION_FILTER_BODY
                .replace("[NUM_THREAD]", &thread.to_string())
                .replace("[FIRST_PARAM]", argument),
            RecoveryStrategy::KiUserExceptionDispatch => {
                KI_USER_EXCEPTION_DISPATCH_BODY.replace("[CHILD_SP]", argument)
            }
            RecoveryStrategy::WerpReportFault => {
                WERP_REPORT_FAULT_BODY.replace("[FOURTH_PARAM]", argument)
            }
            RecoveryStrategy::RtlDispatchException => {
                RTL_DISPATCH_EXCEPTION_BODY.replace("[THIRD_PARAM]", argument)
            }
        };
        wrap(&body)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A debugger script that can recover the exception record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecoveryScript {
    pub strategy: RecoveryStrategy,
    /// The thread whose frame supplied the argument.
    pub thread: usize,
    /// The argument value substituted into the script.
    pub argument: String,
    /// The script text, still writing to `[LOG_FILE]`.
    pub script: String,
}

impl RecoveryScript {
    /// The script with its output going to `log_file`.
    pub fn with_log_file(&self, log_file: &str) -> String {
        self.script.replace(LOG_FILE_PLACEHOLDER, log_file)
    }
}

/// Pick the script for re-acquiring the exception record.
///
/// Each strategy looks up the first frame (in thread order, leaf first)
/// of its function and uses it only if the argument it needs is non-zero.
pub fn select_recovery_script(
    threads: &[ThreadRecord],
    width: PointerWidth,
) -> Option<RecoveryScript> {
    for &strategy in RecoveryStrategy::candidates(width) {
        let Some((thread, frame)) = find_frame_by_keyword(threads, strategy.keyword()) else {
            trace!("no {} frame", strategy);
            continue;
        };
        match strategy.argument(frame) {
            Some(argument) if is_nonzero_address(argument) => {
                debug!(
                    "recovering the exception record through {} on thread {}",
                    strategy, thread.index
                );
                return Some(RecoveryScript {
                    strategy,
                    thread: thread.index,
                    argument: argument.to_owned(),
                    script: strategy.script(thread.index, argument),
                });
            }
            _ => trace!("{} frame has no usable argument", strategy),
        }
    }
    debug!("no way to recover the exception record");
    None
}

/// The first frame whose function names `keyword`, with its thread.
///
/// The keyword is matched without case and must be followed by a
/// non-word character, so `RtlDispatchException` doesn't match
/// `RtlDispatchExceptionEx`.
pub fn find_frame_by_keyword<'a>(
    threads: &'a [ThreadRecord],
    keyword: &str,
) -> Option<(&'a ThreadRecord, &'a StackFrame)> {
    threads.iter().find_map(|thread| {
        thread
            .frames
            .iter()
            .find(|frame| names_function(&frame.function, keyword))
            .map(|frame| (thread, frame))
    })
}

fn names_function(function: &str, keyword: &str) -> bool {
    let function = function.to_ascii_lowercase();
    let keyword = keyword.to_ascii_lowercase();
    function.match_indices(&keyword).any(|(start, _)| {
        function[start + keyword.len()..]
            .chars()
            .next()
            .map_or(false, |c| !(c.is_alphanumeric() || c == '_'))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(call_site: &str, child_sp: &str, args: &[&str]) -> StackFrame {
        StackFrame {
            child_sp: Some(child_sp.to_owned()),
            return_address: Some("7700aa10".to_owned()),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..StackFrame::new(0, call_site)
        }
    }

    fn thread(index: usize, frames: Vec<StackFrame>) -> ThreadRecord {
        ThreadRecord {
            index,
            os_thread_id: format!("{index:x}"),
            frames,
            ..ThreadRecord::default()
        }
    }

    #[test]
    fn test_names_function() {
        assert!(names_function("RtlDispatchException+0x1d4", "RtlDispatchException"));
        assert!(names_function("rtldispatchexception+0x1d4", "RtlDispatchException"));
        assert!(!names_function("RtlDispatchExceptionEx+0x10", "RtlDispatchException"));
        // Nothing follows the name.
        assert!(!names_function("RtlDispatchException", "RtlDispatchException"));
    }

    #[test]
    fn test_unhandled_exception_filter_32() {
        let threads = vec![
            thread(0, vec![frame("ntdll!NtWaitForSingleObject+0xc", "0019f6c0", &["0", "0", "0"])]),
            thread(
                3,
                vec![
                    frame("ntdll!NtWaitForMultipleObjects+0xc", "0062f0a0", &["2", "0062f1f0", "1"]),
                    frame(
                        "KERNELBASE!UnhandledExceptionFilter+0x1a2",
                        "0062f9d8",
                        &["0062fa14", "77d3ae40", "0062fa14"],
                    ),
                ],
            ),
        ];
        let script = select_recovery_script(&threads, PointerWidth::Bits32).unwrap();
        assert_eq!(script.strategy, RecoveryStrategy::UnhandledExceptionFilter);
        assert_eq!(script.thread, 3);
        assert_eq!(script.argument, "0062fa14");
        assert!(script.script.starts_with(".logopen /u \"[LOG_FILE]\"\n||\n"));
        assert!(script.script.contains("~3s\n"));
        assert!(script.script.contains("{dd 0062fa14}"));
        assert!(script.script.ends_with(".logclose\n"));

        let script = script.with_log_file(r"C:\dumps\app.exr.log");
        assert!(script.starts_with(".logopen /u \"C:\\dumps\\app.exr.log\""));
    }

    #[test]
    fn test_zero_argument_falls_through() {
        let threads = vec![thread(
            0,
            vec![
                frame("KERNELBASE!UnhandledExceptionFilter+0x1a2", "0062f9d8", &["00000000", "0", "0"]),
                frame("ntdll!RtlDispatchException+0x6d", "0062fb20", &["0062fb80", "0062fbd0", "0062fc40"]),
            ],
        )];
        let script = select_recovery_script(&threads, PointerWidth::Bits32).unwrap();
        assert_eq!(script.strategy, RecoveryStrategy::RtlDispatchException);
        assert_eq!(script.argument, "0062fc40");
        assert!(script.script.contains(".exr 0062fc40\n"));
    }

    #[test]
    fn test_ki_user_exception_dispatch_64() {
        let threads = vec![thread(
            2,
            vec![
                frame(
                    "ntdll!RtlDispatchException+0x2a1",
                    "000000d0f8bfe4a0",
                    &["000000d0f8bfe9c0", "0", "000000d0f8bfe5b0", "0"],
                ),
                frame(
                    "ntdll!KiUserExceptionDispatch+0x2e",
                    "000000d0f8bfe500",
                    &["0", "0", "0", "0"],
                ),
            ],
        )];
        let script = select_recovery_script(&threads, PointerWidth::Bits64).unwrap();
        assert_eq!(script.strategy, RecoveryStrategy::KiUserExceptionDispatch);
        assert_eq!(script.thread, 2);
        assert!(script
            .script
            .contains(".exr 000000d0f8bfe500 + @@c++(sizeof(ntdll!_CONTEXT)) + 0x20\n"));
    }

    #[test]
    fn test_nothing_to_recover() {
        let threads = vec![thread(0, vec![frame("ntdll!NtDelayExecution+0x14", "0", &[])])];
        assert_eq!(select_recovery_script(&threads, PointerWidth::Bits64), None);
        assert_eq!(select_recovery_script(&[], PointerWidth::Bits32), None);
    }

    #[test]
    fn test_main_script() {
        let script = main_script(PointerWidth::Bits32);
        assert!(script.contains(".block { ~* e ? @eip }"));
        assert!(script.contains(".echo >>> END OF LOG\n.logclose\n"));
        assert!(main_script(PointerWidth::Bits64).contains("? @rip"));
        assert!(INIT_SCRIPT.contains(".echo WOW64 found;"));
    }
}
