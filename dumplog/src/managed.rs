// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The managed runtime's view of the process: its thread table and the
//! managed part of each thread's call stack.

use nom::bytes::complete::take_while1;
use nom::character::complete::{char, space0, space1};
use nom::combinator::rest;
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::IResult;
use serde::Serialize;
use tracing::trace;

use crate::parsers::{decimal_usize, word, word_of_len};
use crate::utils::parse_hex;

/// One row of the managed thread table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ManagedThreadRecord {
    /// The debugger's thread number, shared with the native stacks.
    pub thread_index: usize,
    /// The runtime's own thread number.
    pub managed_index: usize,
    pub os_thread_id: String,
    pub thread_object: String,
    pub state: String,
    pub gc_mode: String,
    pub gc_alloc_context: String,
    pub domain: String,
    pub lock_count: String,
    pub apartment: String,
    /// The thread's last exception, without the object address the runtime
    /// sometimes appends.
    pub exception_description: String,
}

impl ManagedThreadRecord {
    /// Whether the description mentions an exception.
    pub fn reports_exception(&self) -> bool {
        self.exception_description
            .to_ascii_lowercase()
            .matches("exception")
            .count()
            == 1
    }
}

/// Extract the managed thread table. Only rows are kept; headers and
/// summary lines don't fit the layout.
pub fn parse_managed_threads(lines: &[String]) -> Vec<ManagedThreadRecord> {
    lines
        .iter()
        .filter_map(|line| managed_thread_row(line).ok().map(|(_, row)| row))
        .collect()
}

fn alloc_context(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ',' || c == ':')(input)
}

fn lock_count(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')(input)
}

// `   0    1 3b0c 000001ea83a6c7d0  2a020 Preemptive  000001EA8525D3A8:000001EA8525DFD0 000001ea83a41f30 1  MTA System.ArgumentException 000001ea85257290`
fn managed_thread_row(input: &str) -> IResult<&str, ManagedThreadRecord> {
    let (input, (thread_index, managed_index)) = tuple((
        preceded(space0, decimal_usize),
        preceded(space1, decimal_usize),
    ))(input)?;
    let (input, (os_thread_id, thread_object, state, gc_mode, gc_alloc_context)) = tuple((
        preceded(space1, word),
        preceded(space1, word),
        preceded(space1, word),
        preceded(space1, word),
        preceded(space1, alloc_context),
    ))(input)?;
    let (input, (domain, lock_count, apartment, exception)) = tuple((
        preceded(space1, word),
        preceded(space1, lock_count),
        preceded(space1, word),
        rest,
    ))(input)?;
    Ok((
        "",
        ManagedThreadRecord {
            thread_index,
            managed_index,
            os_thread_id: os_thread_id.to_owned(),
            thread_object: thread_object.to_owned(),
            state: state.to_owned(),
            gc_mode: gc_mode.to_owned(),
            gc_alloc_context: gc_alloc_context.to_owned(),
            domain: domain.to_owned(),
            lock_count: lock_count.to_owned(),
            apartment: apartment.to_owned(),
            exception_description: clean_exception_description(exception),
        },
    ))
}

/// Drop a trailing object address from an exception description.
///
/// `System.ArgumentException 000001ea85257290` becomes `System.ArgumentException`.
pub fn clean_exception_description(description: &str) -> String {
    let parts: Vec<&str> = description.split_whitespace().collect();
    match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() && parse_hex(last).is_some() => rest.join(" "),
        _ => parts.join(" "),
    }
}

/// A frame of a managed call stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ManagedFrame {
    pub child_sp: String,
    pub instruction_pointer: String,
    pub call_site: String,
}

/// The managed call stack of one thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ManagedStackRecord {
    pub os_thread_id: String,
    pub thread_index: usize,
    pub frames: Vec<ManagedFrame>,
}

/// Extract the managed call stacks.
///
/// Each stack starts with an `OS Thread Id: <id> (<index>)` header and ends
/// at a stack walk failure, the next header, or the first line that isn't a
/// frame. Threads without a single managed frame get no record.
pub fn parse_managed_stacks(lines: &[String]) -> Vec<ManagedStackRecord> {
    let mut stacks = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let header = stack_header(&lines[idx]);
        idx += 1;
        let Some((os_thread_id, thread_index)) = header else {
            continue;
        };
        let mut frames = Vec::new();
        while idx < lines.len() {
            let line = &lines[idx];
            if line.contains("Child SP") {
                idx += 1;
                continue;
            }
            if line.contains("GetFrameContext failed")
                || line.contains("Unable to walk the managed stack")
            {
                idx += 1;
                break;
            }
            // Leave the next header for the outer loop.
            if line.contains("OS Thread Id") {
                break;
            }
            idx += 1;
            if line.contains("InlinedCallFrame:") {
                continue;
            }
            let Ok((_, mut frame)) = managed_frame(line) else {
                break;
            };
            // A truncated call site continues on the next line.
            while frame.call_site.contains("*** ") && idx < lines.len() {
                frame.call_site = lines[idx].trim().to_owned();
                idx += 1;
            }
            frames.push(frame);
        }
        if frames.is_empty() {
            trace!("no managed frames for thread {}", thread_index);
            continue;
        }
        stacks.push(ManagedStackRecord {
            os_thread_id: os_thread_id.to_owned(),
            thread_index,
            frames,
        });
    }
    stacks
}

// `OS Thread Id: 0x3b0c (0)` -> (`0x3b0c`, 0)
fn stack_header(line: &str) -> Option<(&str, usize)> {
    let (_, rest) = line.split_once("OS Thread Id: ")?;
    let result: IResult<&str, (&str, usize)> = tuple((
        terminated(word, char(' ')),
        delimited(char('('), decimal_usize, char(')')),
    ))(rest);
    result.ok().map(|(_, header)| header)
}

// `000000d0f8bfe9c8 00007ffb6e1a5c3a ConsoleApp.Program.Main(System.String[])`
fn managed_frame(input: &str) -> IResult<&str, ManagedFrame> {
    let (call_site, (child_sp, instruction_pointer)) = tuple((
        preceded(space0, word_of_len(8, 16)),
        delimited(space1, word_of_len(8, 16), space1),
    ))(input)?;
    let call_site = call_site.trim_end();
    if call_site.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::NonEmpty,
        )));
    }
    Ok((
        "",
        ManagedFrame {
            child_sp: child_sp.to_owned(),
            instruction_pointer: instruction_pointer.to_owned(),
            call_site: call_site.to_owned(),
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn test_clean_exception_description() {
        assert_eq!(
            clean_exception_description("System.ArgumentException 000001ea85257290"),
            "System.ArgumentException"
        );
        assert_eq!(
            clean_exception_description("System.ArgumentException"),
            "System.ArgumentException"
        );
        assert_eq!(
            clean_exception_description("System.IO.IOException (nested)"),
            "System.IO.IOException (nested)"
        );
        // A description that is only an address is kept.
        assert_eq!(clean_exception_description("000001ea85257290"), "000001ea85257290");
        assert_eq!(clean_exception_description(""), "");
    }

    #[test]
    fn test_parse_managed_threads() {
        let threads = parse_managed_threads(&lines(
            "ThreadCount:      3
                                                                                                        Lock
       ID OSID ThreadOBJ           State GC Mode     GC Alloc Context                  Domain           Count Apt Exception
   0    1 3b0c 000001ea83a6c7d0    2a020 Preemptive  000001EA8525D3A8:000001EA8525DFD0 000001ea83a41f30 1     MTA System.ArgumentException 000001ea85257290
   6    2 2b5c 000001ea83a9a1e0    2b220 Preemptive  0000000000000000:0000000000000000 000001ea83a41f30 0     MTA (Finalizer)
XXXX    3    0 000001ea83ad0a40  8039820 Preemptive  0000000000000000:0000000000000000 000001ea83a41f30 -1    MTA (Threadpool Completion Port)",
        ));
        assert_eq!(threads.len(), 2);
        let thread = &threads[0];
        assert_eq!(thread.thread_index, 0);
        assert_eq!(thread.managed_index, 1);
        assert_eq!(thread.os_thread_id, "3b0c");
        assert_eq!(thread.state, "2a020");
        assert_eq!(thread.gc_mode, "Preemptive");
        assert_eq!(
            thread.gc_alloc_context,
            "000001EA8525D3A8:000001EA8525DFD0"
        );
        assert_eq!(thread.lock_count, "1");
        assert_eq!(thread.apartment, "MTA");
        assert_eq!(thread.exception_description, "System.ArgumentException");
        assert!(thread.reports_exception());

        assert_eq!(threads[1].thread_index, 6);
        assert_eq!(threads[1].exception_description, "(Finalizer)");
        assert!(!threads[1].reports_exception());
    }

    #[test]
    fn test_parse_managed_stacks() {
        let stacks = parse_managed_stacks(&lines(
            "OS Thread Id: 0x3b0c (0)
        Child SP               IP Call Site
000000d0f8bfe7b8 0000000000000000 [InlinedCallFrame: 000000d0f8bfe7b8]
000000d0f8bfe9c8 00007ffb6e1a5c3a ConsoleApp.Program.Crash(Int32) [C:\\src\\Program.cs @ 20]
000000d0f8bfea10 00007ffb6e1a5b11 *** WARNING: Unable to verify checksum for ConsoleApp.exe
ConsoleApp.Program.Main(System.String[]) [C:\\src\\Program.cs @ 12]
OS Thread Id: 0x2b5c (6)
Unable to walk the managed stack. The current thread is likely not a
managed thread. You can run !threads to get a list of managed threads in
the process
OS Thread Id: 0x1c20 (2)
000000d0f8dffa00 00007ffb6e1a6000 System.Threading.ThreadHelper.ThreadStart()
000000d0f8dffa50 00007ffb6e1a6100 System.Threading.ExecutionContext.Run()
Failed to do something
000000d0f8dffb00 00007ffb6e1a6200 ignored after the block ended",
        ));
        assert_eq!(stacks.len(), 2);
        let stack = &stacks[0];
        assert_eq!(stack.os_thread_id, "0x3b0c");
        assert_eq!(stack.thread_index, 0);
        assert_eq!(stack.frames.len(), 2);
        assert_eq!(stack.frames[0].child_sp, "000000d0f8bfe9c8");
        assert_eq!(stack.frames[0].instruction_pointer, "00007ffb6e1a5c3a");
        assert_eq!(
            stack.frames[1].call_site,
            "ConsoleApp.Program.Main(System.String[]) [C:\\src\\Program.cs @ 12]"
        );

        assert_eq!(stacks[1].thread_index, 2);
        assert_eq!(stacks[1].frames.len(), 2);
    }

    #[test]
    fn test_stack_header() {
        assert_eq!(stack_header("OS Thread Id: 0x3b0c (0)"), Some(("0x3b0c", 0)));
        assert_eq!(stack_header("OS Thread Id: 0x3b0c"), None);
    }
}
