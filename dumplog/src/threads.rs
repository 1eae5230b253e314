// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Native thread call stacks.

use nom::character::complete::{char, space0, space1};
use nom::multi::separated_list1;
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::IResult;
use serde::Serialize;
use tracing::{debug, trace};

use crate::metadata::PointerWidth;
use crate::parsers::{address, register_token, word};
use crate::utils::parse_hex;

/// One frame of a native call stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    /// Position in the stack, starting at 0 for the leaf.
    pub ordinal: usize,
    /// An inlined function. Inline frames have no address columns.
    pub inline: bool,
    pub child_sp: Option<String>,
    pub return_address: Option<String>,
    /// The "Args to Child" columns: three on 32-bit, four on 64-bit.
    pub args: Vec<String>,
    /// The call site as printed (after cleanup), e.g. `ntdll!NtWaitForSingleObject+0x14`.
    pub call_site: String,
    pub module: Option<String>,
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl StackFrame {
    /// Build a frame from a call site, decomposing it.
    pub fn new(ordinal: usize, call_site: &str) -> StackFrame {
        let mut frame = StackFrame {
            ordinal,
            ..StackFrame::default()
        };
        frame.set_call_site(call_site);
        frame
    }

    /// Replace the call site text and re-derive module, function and location.
    pub fn set_call_site(&mut self, call_site: &str) {
        let call_site = CallSite::parse(call_site);
        self.call_site = call_site.text;
        self.module = call_site.module;
        self.function = call_site.function;
        self.file = call_site.file;
        self.line = call_site.line;
    }

    /// The `n`th argument (1-based), as the debugger printed it.
    pub fn arg(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|idx| self.args.get(idx))
            .map(String::as_str)
    }

    pub fn return_address_value(&self) -> Option<u64> {
        self.return_address.as_deref().and_then(parse_hex)
    }
}

/// A call site split into its parts.
///
/// The debugger prints `module!function [file @ line]`, where both the
/// module and the source location may be missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallSite {
    pub text: String,
    pub module: Option<String>,
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl CallSite {
    pub fn parse(text: &str) -> CallSite {
        // cdb tags some managed frames with this; windbg doesn't.
        let text = text.replace("<Module>", "").trim().to_owned();
        let mut parts = text.split('!');
        let (module, remainder) = match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(remainder), None) => (module, remainder),
            _ => {
                return CallSite {
                    function: text.clone(),
                    text,
                    ..CallSite::default()
                }
            }
        };
        let (function, file, line) = match source_location(remainder) {
            Some((function, file, line)) => (function, Some(file.to_owned()), Some(line)),
            None => (remainder, None, None),
        };
        CallSite {
            module: Some(module.to_owned()),
            function: function.trim().to_owned(),
            file,
            line,
            text: text.clone(),
        }
    }
}

// `Main(System.String[]) [C:\src\Program.cs @ 12]` -> (`Main(System.String[]) `, `C:\src\Program.cs`, 12)
fn source_location(text: &str) -> Option<(&str, &str, u32)> {
    let open = text.rfind('[')?;
    let function = &text[..open];
    if function.is_empty() {
        return None;
    }
    let location = &text[open + 1..];
    let location = &location[..location.rfind(']')?];
    let (file, line) = location.rsplit_once(" @ ")?;
    let line = line.trim().parse().ok()?;
    (!file.trim().is_empty()).then_some((function, file, line))
}

/// The call stack of one thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ThreadRecord {
    /// The debugger's thread number. Every other per-thread record refers
    /// to a thread by this index.
    pub index: usize,
    pub os_thread_id: String,
    /// Assigned after parsing from the instruction pointer section.
    pub instruction_pointer: Option<String>,
    /// Leaf frame first.
    pub frames: Vec<StackFrame>,
}

impl ThreadRecord {
    /// The concatenated return addresses of the stack.
    pub fn stack_signature(&self) -> String {
        self.frames
            .iter()
            .filter_map(|frame| frame.return_address.as_deref())
            .collect()
    }

    /// Whether any frame returns to `address`.
    pub fn has_return_address(&self, address: u64) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.return_address_value() == Some(address))
    }

    pub fn instruction_pointer_value(&self) -> Option<u64> {
        self.instruction_pointer.as_deref().and_then(parse_hex)
    }

    fn push_frame(&mut self, mut frame: StackFrame) {
        frame.ordinal = self.frames.len();
        self.frames.push(frame);
    }
}

/// Extract the thread stacks.
///
/// A thread header line starts a new thread. Frame rows are read with the
/// column layout of `width`; rows before the first header and rows that
/// don't fit the layout are skipped.
pub fn parse_thread_stacks(lines: &[String], width: PointerWidth) -> Vec<ThreadRecord> {
    let mut threads: Vec<ThreadRecord> = Vec::new();
    for line in lines {
        if line.contains("Id:") {
            if let Some((index, os_thread_id)) = thread_header(line) {
                trace!("thread {} ({})", index, os_thread_id);
                threads.push(ThreadRecord {
                    index,
                    os_thread_id: os_thread_id.to_owned(),
                    ..ThreadRecord::default()
                });
            }
            continue;
        }
        let Some(thread) = threads.last_mut() else {
            continue;
        };
        if line.contains("Inline Function") || line.contains("(Inline)") {
            thread.push_frame(inline_frame(line));
            continue;
        }
        let frame = match width {
            PointerWidth::Bits32 => frame_row_32(line),
            PointerWidth::Bits64 => frame_row_64(line),
        };
        match frame {
            Some(frame) => thread.push_frame(frame),
            None => trace!("not a frame row: {}", line),
        }
    }
    if threads.is_empty() && !lines.is_empty() {
        debug!("no thread headers in {} lines of stacks", lines.len());
    }
    threads
}

// `.  0  Id: 3f44.2d8c Suspend: 0 Teb: 000000d0`f8c1f000 Unfrozen` -> (0, `2d8c`)
fn thread_header(line: &str) -> Option<(usize, &str)> {
    let (before, after) = line.split_once("Id:")?;
    if !before.ends_with(char::is_whitespace) {
        return None;
    }
    let index = before.split_whitespace().last()?.parse().ok()?;
    let after = after.strip_prefix(char::is_whitespace)?;
    let ids = after.split_whitespace().next()?;
    let (_, tid) = ids.rsplit_once('.')?;
    let (_, tid) = word(tid).ok()?;
    let (_, teb) = after.split_once(" Teb: ")?;
    register_token(teb.trim_start()).ok()?;
    Some((index, tid))
}

// `00 00007ffb`1f6a4fd4 --------`-------- (Inline Function) --------`-------- : app!helper [x.cpp @ 3]`
fn inline_frame(line: &str) -> StackFrame {
    let call_site = line.rsplit("--------").next().unwrap_or(line);
    let call_site = call_site.trim_matches(|c| c == ' ' || c == ':');
    StackFrame {
        inline: true,
        ..StackFrame::new(0, call_site)
    }
}

// `[nn] child-sp retaddr : arg1 arg2 arg3 arg4 : call site`
fn frame_row_64(line: &str) -> Option<StackFrame> {
    let result: IResult<&str, (Vec<String>, Vec<String>)> = tuple((
        preceded(space0, separated_list1(space1, address)),
        preceded(
            delimited(space1, char(':'), space1),
            terminated(
                separated_list1(space1, address),
                delimited(space1, char(':'), space0),
            ),
        ),
    ))(line);
    let (call_site, (mut columns, args)) = result.ok()?;
    if !(2..=3).contains(&columns.len()) || args.len() != 4 {
        return None;
    }
    let return_address = columns.pop();
    let child_sp = columns.pop();
    Some(StackFrame {
        child_sp,
        return_address,
        args,
        ..StackFrame::new(0, call_site)
    })
}

// `nn childebp retaddr arg1 arg2 arg3 call site`
fn frame_row_32(line: &str) -> Option<StackFrame> {
    let result: IResult<&str, (&str, String, String, String, String, String)> = tuple((
        preceded(space0, terminated(word, space1)),
        terminated(address, space1),
        terminated(address, space1),
        terminated(address, space1),
        terminated(address, space1),
        terminated(address, space1),
    ))(line);
    let (call_site, (_, child_sp, return_address, arg1, arg2, arg3)) = result.ok()?;
    Some(StackFrame {
        child_sp: Some(child_sp),
        return_address: Some(return_address),
        args: vec![arg1, arg2, arg3],
        ..StackFrame::new(0, call_site)
    })
}
