// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Joining the sections of a transcript.
//!
//! The extractors in `dumplog` each read one section in isolation. The
//! correlator is the one place where their outputs meet: it builds the
//! final thread list from the native stacks, the exception call stack,
//! the managed stacks and the instruction pointers.

use dumplog::utils::{same_address, strip_backticks};
use dumplog::{ManagedFrame, ManagedStackRecord, ModuleRecord, PointerWidth, StackFrame, ThreadRecord, Transcript};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Module name given to managed frames whose text has none.
const MANAGED_MODULE: &str = "(managed)";

/// Threads that share a call stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ThreadGroup {
    /// The concatenated return addresses of the stack.
    pub signature: String,
    /// Thread indices, in the order the threads were listed.
    pub threads: Vec<usize>,
}

/// The correlated threads of a transcript.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Correlation {
    pub threads: Vec<ThreadRecord>,
    pub groups: Vec<ThreadGroup>,
    /// Advisory notes about the transcript.
    pub notes: Vec<String>,
}

/// Build the final thread list and group it.
///
/// The reported exception stack goes in first, so that managed frames
/// and instruction pointers land on the stack that is shown.
pub fn correlate(transcript: &Transcript, symbol_folder: Option<&str>) -> Correlation {
    let mut threads = transcript.threads.clone();
    if let Some(reported) = &transcript.exception_record.call_stack {
        threads = apply_reported_stack(threads, reported);
    }
    threads = stitch_managed_frames(
        threads,
        &transcript.managed_stacks,
        transcript.pointer_width(),
    );
    threads = assign_instruction_pointers(threads, &transcript.instruction_pointers);

    let mut notes = Vec::new();
    if let Some(note) = symbol_folder.and_then(|folder| symbol_health_note(&transcript.modules, folder)) {
        notes.push(note);
    }
    if threads.is_empty() {
        notes.push(String::from("No thread call stacks were found in the log."));
    }

    let groups = group_by_call_stack(&threads);
    Correlation {
        threads,
        groups,
        notes,
    }
}

/// Replace a thread's stack with the one printed with the exception record.
///
/// The thread stack section may show a stack that says nothing about the
/// crash, e.g. the dump writer's own context. A reported stack for a
/// thread that isn't listed is dropped.
pub fn apply_reported_stack(mut threads: Vec<ThreadRecord>, reported: &ThreadRecord) -> Vec<ThreadRecord> {
    match threads.iter_mut().find(|thread| thread.index == reported.index) {
        Some(thread) => {
            debug!("using the exception call stack for thread {}", reported.index);
            *thread = reported.clone();
        }
        None => warn!(
            "exception call stack for thread {}, which isn't listed",
            reported.index
        ),
    }
    threads
}

/// Name the native frames that run managed code.
///
/// On 32-bit, the debugger prints a managed frame's native call site as
/// its bare instruction pointer; on 64-bit the frames are matched by
/// their child stack pointer. Frames without a matching managed frame are
/// left alone.
pub fn stitch_managed_frames(
    mut threads: Vec<ThreadRecord>,
    stacks: &[ManagedStackRecord],
    width: PointerWidth,
) -> Vec<ThreadRecord> {
    for stack in stacks {
        let Some(thread) = threads
            .iter_mut()
            .find(|thread| thread.index == stack.thread_index)
        else {
            debug!(
                "managed stack for thread {}, which has no native stack",
                stack.thread_index
            );
            continue;
        };
        for managed in &stack.frames {
            let native = thread
                .frames
                .iter_mut()
                .filter(|frame| !frame.inline)
                .find(|frame| is_same_frame(frame, managed, width));
            match native {
                Some(native) => {
                    trace!(
                        "thread {} frame {} is {}",
                        thread.index,
                        native.ordinal,
                        managed.call_site
                    );
                    native.set_call_site(&managed_call_site(&managed.call_site));
                }
                None => trace!("no native frame for {}", managed.call_site),
            }
        }
    }
    threads
}

fn is_same_frame(native: &StackFrame, managed: &ManagedFrame, width: PointerWidth) -> bool {
    match width {
        PointerWidth::Bits32 => same_address(&managed.instruction_pointer, &native.call_site),
        PointerWidth::Bits64 => {
            native.child_sp.as_deref() == Some(strip_backticks(&managed.child_sp).as_str())
        }
    }
}

fn managed_call_site(call_site: &str) -> String {
    if call_site.contains('!') {
        call_site.to_owned()
    } else {
        format!("{MANAGED_MODULE}!{call_site}")
    }
}

/// Give each thread its instruction pointer.
///
/// The pointers are listed in thread order without thread numbers, so
/// this only happens when there is exactly one per thread.
pub fn assign_instruction_pointers(mut threads: Vec<ThreadRecord>, pointers: &[String]) -> Vec<ThreadRecord> {
    if pointers.len() != threads.len() {
        debug!(
            "{} instruction pointers for {} threads, not assigning them",
            pointers.len(),
            threads.len()
        );
        return threads;
    }
    for (thread, pointer) in threads.iter_mut().zip(pointers) {
        thread.instruction_pointer = Some(pointer.clone());
    }
    threads
}

/// A note for when no module's symbols came from `folder`.
pub fn symbol_health_note(modules: &[ModuleRecord], folder: &str) -> Option<String> {
    let expected = folder.to_uppercase();
    let loaded = modules
        .iter()
        .any(|module| module.symbol_path.to_uppercase().contains(&expected));
    (!loaded).then(|| format!("No PDBs loaded from {folder}"))
}

/// Group threads with identical call stacks.
///
/// Groups are ordered by their first thread, and threads keep their order
/// within a group.
pub fn group_by_call_stack(threads: &[ThreadRecord]) -> Vec<ThreadGroup> {
    let mut groups: Vec<ThreadGroup> = Vec::new();
    for thread in threads {
        let signature = thread.stack_signature();
        match groups.iter_mut().find(|group| group.signature == signature) {
            Some(group) => group.threads.push(thread.index),
            None => groups.push(ThreadGroup {
                signature,
                threads: vec![thread.index],
            }),
        }
    }
    groups
}
