// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Working out which thread crashed.

use std::fmt;

use dumplog::utils::parse_hex;
use dumplog::{ManagedThreadRecord, PointerWidth, StackFrame, ThreadRecord, Transcript};
use serde::Serialize;
use tracing::{debug, trace};

/// Call-site fragments that show up in the stack of a thread that is
/// handling a crash, most telling first.
pub const EXCEPTION_KEYWORDS: &[&str] = &[
    "UnhandledExceptionFilter",
    "WerpReportFault",
    "KiUserExceptionDispatch",
    "RtlDispatchException",
    "CWinApp::ProcessWndProcException",
    "invoke_watson",
    "!abort+",
];

/// How the faulting thread was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultStrategy {
    /// The debugger printed the thread's stack with the exception record.
    ReportedThread,
    /// One thread's stack returns to the exception address.
    ExceptionAddress,
    /// One thread's instruction pointer is the exception address.
    InstructionPointer,
    /// One managed thread holds an exception.
    ManagedException,
    /// The thread's stack contains an exception handling function.
    StackKeyword,
    /// The thread's stack contains the stack the heap manager recorded.
    HeapStack,
}

impl FaultStrategy {
    pub fn description(self) -> &'static str {
        match self {
            FaultStrategy::ReportedThread => "reported by the debugger",
            FaultStrategy::ExceptionAddress => "exception address in call stack",
            FaultStrategy::InstructionPointer => "exception address in instruction pointer",
            FaultStrategy::ManagedException => "managed exception",
            FaultStrategy::StackKeyword => "exception handler in call stack",
            FaultStrategy::HeapStack => "heap corruption call stack",
        }
    }
}

impl fmt::Display for FaultStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The result of looking for the faulting thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultOutcome {
    Resolved {
        thread: usize,
        strategy: FaultStrategy,
    },
    /// Several threads return to the exception address and none of them
    /// is handling an exception.
    Ambiguous { candidates: Vec<usize> },
    /// There is an exception, but no thread could be tied to it.
    Unresolved,
    /// There is no exception and no thread looks like it crashed.
    NoException,
}

/// What is known about the crash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExceptionSummary {
    /// The exception address, 0 when unknown.
    pub address: u64,
    pub code: Option<String>,
    pub description: Option<String>,
    /// Where the exception happened, e.g. `ConsoleApp!Crash+0x2a`.
    pub frame: Option<String>,
    pub module: Option<String>,
    /// The summary comes from a heap corruption report.
    pub heap_corruption: bool,
    pub outcome: FaultOutcome,
}

impl ExceptionSummary {
    /// The faulting thread, if one was resolved.
    pub fn thread(&self) -> Option<usize> {
        match self.outcome {
            FaultOutcome::Resolved { thread, .. } => Some(thread),
            _ => None,
        }
    }

    pub fn strategy(&self) -> Option<FaultStrategy> {
        match self.outcome {
            FaultOutcome::Resolved { strategy, .. } => Some(strategy),
            _ => None,
        }
    }

    /// `true` if there is an exception to report.
    pub fn found(&self) -> bool {
        self.outcome != FaultOutcome::NoException
    }
}

/// Summarize the exception and find the faulting thread.
///
/// `threads` is the correlated thread list. A heap corruption report
/// takes precedence over the exception record; otherwise the strategies
/// are tried in order and the first one to name a single thread wins.
pub fn resolve(transcript: &Transcript, threads: &[ThreadRecord]) -> ExceptionSummary {
    if let Some(heap) = &transcript.heap_corruption {
        let matches = threads_containing_stack(threads, &heap.stack, transcript.pointer_width());
        let outcome = match matches[..] {
            [thread] => FaultOutcome::Resolved {
                thread,
                strategy: FaultStrategy::HeapStack,
            },
            _ => FaultOutcome::Unresolved,
        };
        debug!("heap corruption, outcome {:?}", outcome);
        return ExceptionSummary {
            address: 0,
            code: None,
            description: Some(heap.description()),
            frame: None,
            module: None,
            heap_corruption: true,
            outcome,
        };
    }

    let record = &transcript.exception_record;
    let outcome = find_fault_thread(transcript, threads);
    debug!("fault thread outcome: {:?}", outcome);
    let mut summary = ExceptionSummary {
        address: record.address,
        code: record.code.clone(),
        description: record.description.clone(),
        frame: record.frame.clone(),
        module: record.module.clone(),
        heap_corruption: false,
        outcome,
    };

    // The record of a managed exception only says "CLR exception".
    if record.is_clr_exception || summary.description.is_none() {
        if let Some(managed) = managed_fault_thread(&transcript.managed_threads) {
            summary.description = Some(managed.exception_description.clone());
        }
    }

    if summary.address != 0 && (summary.frame.is_none() || summary.module.is_none()) {
        let fault_frame = summary
            .thread()
            .and_then(|index| threads.iter().find(|thread| thread.index == index))
            .and_then(|thread| frame_at_address(thread, summary.address));
        if let Some(frame) = fault_frame {
            if summary.frame.is_none() {
                summary.frame = Some(frame.call_site.clone());
            }
            if summary.module.is_none() {
                summary.module = frame.module.clone();
            }
        }
    }
    summary
}

fn find_fault_thread(transcript: &Transcript, threads: &[ThreadRecord]) -> FaultOutcome {
    let record = &transcript.exception_record;
    let resolved = |thread, strategy| FaultOutcome::Resolved { thread, strategy };

    if let Some(reported) = &record.call_stack {
        if threads.iter().any(|thread| thread.index == reported.index) {
            return resolved(reported.index, FaultStrategy::ReportedThread);
        }
    }

    if record.address != 0 {
        let candidates = threads_with_return_address(threads, record.address);
        if candidates.len() == 1 {
            return resolved(candidates[0], FaultStrategy::ExceptionAddress);
        }
        if candidates.len() > 1 {
            let candidate_threads = threads
                .iter()
                .filter(|thread| candidates.contains(&thread.index));
            return match find_keyword_thread(candidate_threads) {
                Some(thread) => resolved(thread, FaultStrategy::StackKeyword),
                None => FaultOutcome::Ambiguous { candidates },
            };
        }
        trace!("no stack returns to {:#x}", record.address);

        let pointer_position = transcript
            .instruction_pointers
            .iter()
            .position(|pointer| parse_hex(pointer) == Some(record.address));
        if let Some(position) = pointer_position {
            let thread = threads.get(position).map_or(position, |thread| thread.index);
            return resolved(thread, FaultStrategy::InstructionPointer);
        }
    }

    if let Some(managed) = managed_fault_thread(&transcript.managed_threads) {
        return resolved(managed.thread_index, FaultStrategy::ManagedException);
    }

    if let Some(thread) = find_keyword_thread(threads.iter()) {
        return resolved(thread, FaultStrategy::StackKeyword);
    }

    if record.address != 0 {
        FaultOutcome::Unresolved
    } else {
        FaultOutcome::NoException
    }
}

/// The indices of the threads with a frame returning to `address`.
pub fn threads_with_return_address(threads: &[ThreadRecord], address: u64) -> Vec<usize> {
    threads
        .iter()
        .filter(|thread| thread.has_return_address(address))
        .map(|thread| thread.index)
        .collect()
}

/// The indices of the threads whose return addresses contain `stack`.
///
/// Both stacks are compared as concatenated uppercase hex, the way the
/// debugger prints full-width addresses. An empty stack matches nothing.
pub fn threads_containing_stack(threads: &[ThreadRecord], stack: &[u64], width: PointerWidth) -> Vec<usize> {
    if stack.is_empty() {
        return Vec::new();
    }
    let digits = width.hex_digits();
    let stamp: String = stack
        .iter()
        .map(|address| format!("{address:0digits$X}"))
        .collect();
    threads
        .iter()
        .filter(|thread| thread.stack_signature().to_uppercase().contains(&stamp))
        .map(|thread| thread.index)
        .collect()
}

/// The managed thread holding an exception, if exactly one does.
pub fn managed_fault_thread(managed_threads: &[ManagedThreadRecord]) -> Option<&ManagedThreadRecord> {
    let mut faulting = managed_threads.iter().filter(|thread| thread.reports_exception());
    let thread = faulting.next()?;
    if faulting.next().is_some() {
        debug!("several managed threads hold an exception");
        return None;
    }
    Some(thread)
}

/// The first thread with a frame whose call site contains one of the
/// exception keywords.
pub fn find_keyword_thread<'a, I>(threads: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a ThreadRecord>,
{
    threads
        .into_iter()
        .find(|thread| {
            thread.frames.iter().any(|frame| {
                EXCEPTION_KEYWORDS
                    .iter()
                    .any(|keyword| frame.call_site.contains(keyword))
            })
        })
        .map(|thread| thread.index)
}

/// The frame of `thread` that holds `address`.
///
/// That is the leaf frame when the thread's instruction pointer is the
/// address. Otherwise a frame's return address points into its caller,
/// the frame after it.
pub fn frame_at_address(thread: &ThreadRecord, address: u64) -> Option<&StackFrame> {
    if thread.instruction_pointer_value() == Some(address) {
        return thread.frames.first();
    }
    thread
        .frames
        .windows(2)
        .find(|pair| !pair[0].inline && pair[0].return_address_value() == Some(address))
        .map(|pair| &pair[1])
}
