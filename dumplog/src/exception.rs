// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The exception record and the heap corruption report.

use nom::character::complete::{char, space1};
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;
use serde::Serialize;
use tracing::{debug, trace};

use crate::metadata::PointerWidth;
use crate::parsers::{value_after, word};
use crate::threads::{parse_thread_stacks, ThreadRecord};
use crate::utils::parse_hex;

/// The exception record the debugger reported for the dump.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExceptionRecord {
    /// The faulting address, 0 if there was no record.
    pub address: u64,
    /// The symbolic location of the address, e.g. `ConsoleApp!Crash+0x2a`.
    pub frame: Option<String>,
    pub module: Option<String>,
    /// The exception code, e.g. `c0000005`.
    pub code: Option<String>,
    /// The text the debugger prints after the code, e.g. `Access violation`.
    pub description: Option<String>,
    /// The code is the managed runtime's exception code.
    pub is_clr_exception: bool,
    /// The stack of the faulting thread, when the debugger printed it
    /// with the record.
    pub call_stack: Option<ThreadRecord>,
}

impl ExceptionRecord {
    pub fn is_present(&self) -> bool {
        self.address != 0
    }
}

/// Extract an exception record.
///
/// This is used for the exception section of a transcript and for the
/// output of a recovery script, which has no section markers. A zero
/// address or an unusable exception context ends the record.
pub fn parse_exception_record(lines: &[String], width: PointerWidth) -> ExceptionRecord {
    let mut record = ExceptionRecord::default();
    for (idx, line) in lines.iter().enumerate() {
        if line.contains("ExceptionAddress:") {
            let Some(address) = value_after(line, "ExceptionAddress:")
                .and_then(|value| word(value).ok())
                .and_then(|(_, value)| parse_hex(value))
            else {
                debug!("unreadable exception address: {}", line);
                continue;
            };
            if address == 0 {
                trace!("exception address is zero, no record");
                return ExceptionRecord::default();
            }
            record.address = address;
            if let Some(frame) = address_frame(line) {
                record.module = frame.split_once('!').map(|(module, _)| module.to_owned());
                record.frame = Some(frame.to_owned());
            }
        } else if let Some(code) = line.split_once("ExceptionCode: ").map(|(_, code)| code) {
            let (code, description) = split_code(code);
            record.code = code;
            record.description = description;
            if line.contains("CLR exception") {
                record.is_clr_exception = true;
            }
        } else if line.contains("EXCEPTION CALL STACK:") || line.contains("EXCEPTION THREAD:") {
            record.call_stack = parse_thread_stacks(&lines[idx + 1..], width)
                .into_iter()
                .next();
            break;
        } else if line.contains("Unable to get exception context") {
            debug!("no exception context");
            break;
        }
    }
    record
}

// `ExceptionAddress: 00007ff64e1c1a2a (ConsoleApp!Crash+0x000000000000002a)`
fn address_frame(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once(" (")?;
    let frame = &rest[..rest.rfind(')')?];
    (!frame.is_empty()).then_some(frame)
}

// `c0000005 (Access violation)` -> (`c0000005`, `Access violation`)
fn split_code(text: &str) -> (Option<String>, Option<String>) {
    let text = text.trim();
    let code = text
        .split_whitespace()
        .next()
        .map(str::to_owned);
    let description = text.find('(').and_then(|open| {
        let inner = &text[open + 1..];
        let close = inner.rfind(')')?;
        let description = inner[..close].trim();
        (!description.is_empty()).then(|| description.to_owned())
    });
    (code, description)
}

/// A heap corruption the heap manager detected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeapCorruption {
    pub error_type: String,
    pub details: String,
    /// The stack the heap manager recorded, leaf first.
    pub stack: Vec<u64>,
}

impl HeapCorruption {
    pub fn description(&self) -> String {
        if self.details.is_empty() {
            format!("Heap corruption ({}).", self.error_type)
        } else {
            format!("Heap corruption ({}). {}", self.error_type, self.details)
        }
    }
}

/// Extract a heap corruption report, if the heap section has one.
pub fn parse_heap_corruption(lines: &[String]) -> Option<HeapCorruption> {
    let start = lines.iter().position(|line| line.contains("Error type:"))?;
    let error_type = value_after(&lines[start], "Error type:")?.to_owned();
    let mut details = Vec::new();
    let mut stack = Vec::new();
    let mut rest = lines[start + 1..].iter();
    for line in rest.by_ref() {
        if line.contains("Stack trace:") {
            break;
        }
        let detail = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !detail.is_empty() {
            details.push(detail);
        }
    }
    for line in rest {
        if line.contains("*** WARNING") || line.contains("Stack trace") {
            continue;
        }
        match heap_frame(line) {
            Ok((_, address)) => stack.push(address),
            Err(_) => break,
        }
    }
    Some(HeapCorruption {
        error_type,
        details: details.join(" "),
        stack,
    })
}

// `        00007ffb1f6f4a8a: ntdll!RtlpLogHeapFailure+0x4e`
fn heap_frame(input: &str) -> IResult<&str, u64> {
    let (input, address) = preceded(space1, terminated(word, tuple((char(':'), space1))))(input)?;
    match parse_hex(address) {
        Some(address) => Ok((input, address)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}
