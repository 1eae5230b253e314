// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The state of a process, as a debugger transcript describes it.

use std::io;
use std::io::prelude::*;

use dumplog::utils::{format_address, parse_hex};
use dumplog::{
    DumpMetadata, Error, ManagedThreadRecord, ModuleRecord, PointerWidth, StackFrame, TargetInfo,
    ThreadRecord,
};
use serde_json::json;

use crate::correlator::ThreadGroup;
use crate::recovery::RecoveryScript;
use crate::resolver::{ExceptionSummary, FaultOutcome};

/// The state of a process as recorded by a debugger transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessState {
    pub metadata: DumpMetadata,
    pub target_info: TargetInfo,
    pub modules: Vec<ModuleRecord>,
    pub managed_threads: Vec<ManagedThreadRecord>,
    /// The correlated threads, in the order the debugger listed them.
    pub threads: Vec<ThreadRecord>,
    /// `threads` grouped by identical call stacks.
    pub thread_groups: Vec<ThreadGroup>,
    pub exception: ExceptionSummary,
    /// Advisory notes about the transcript and how it was produced.
    pub notes: Vec<String>,
    /// A script to re-acquire the exception record, when one is needed
    /// and the stacks show where to find it.
    pub recovery_script: Option<RecoveryScript>,
    /// Frames with source files under this root are marked in reports.
    pub source_root: Option<String>,
    /// Why only part of the transcript could be read.
    pub error: Option<Error>,
}

impl ProcessState {
    /// Mark the state as coming from a transcript that failed to read.
    pub fn with_error(self, error: Error) -> ProcessState {
        ProcessState {
            error: Some(error),
            ..self
        }
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.metadata.pointer_width()
    }

    /// The faulting thread, if it was found and is listed.
    pub fn fault_thread(&self) -> Option<&ThreadRecord> {
        let index = self.exception.thread()?;
        self.threads.iter().find(|thread| thread.index == index)
    }

    pub fn is_fault_thread(&self, index: usize) -> bool {
        self.exception.thread() == Some(index)
    }

    /// `true` if the exception record should be re-acquired with a
    /// recovery script.
    pub fn needs_exception_record(&self) -> bool {
        !self.exception.heap_corruption && self.exception.address == 0
    }

    /// Whether `frame`'s source file lives under the source root.
    pub fn is_source_frame(&self, frame: &StackFrame) -> bool {
        match (&self.source_root, &frame.file) {
            (Some(root), Some(file)) => !root.is_empty() && file.to_lowercase().contains(&root.to_lowercase()),
            _ => false,
        }
    }

    /// Write a human-readable description of the process state to `f`.
    ///
    /// This is very verbose: it lists every thread group and module.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        self.print_internal(f, false)
    }

    /// Write a brief human-readable description of the process state to `f`.
    ///
    /// Only includes the summary at the top and the faulting thread's stack.
    pub fn print_brief<T: Write>(&self, f: &mut T) -> io::Result<()> {
        self.print_internal(f, true)
    }

    fn print_internal<T: Write>(&self, f: &mut T, brief: bool) -> io::Result<()> {
        if let Some(error) = &self.error {
            writeln!(f, "Error: {error}")?;
            writeln!(f)?;
        }

        let width = self.pointer_width();
        let metadata = &self.metadata;
        if metadata.architecture.is_empty() {
            writeln!(f, "Architecture: unknown")?;
        } else {
            write!(f, "Architecture: {} ({}-bit)", metadata.architecture, width.bits())?;
            if metadata.wow64 {
                write!(f, ", WOW64")?;
            }
            writeln!(f)?;
        }
        if let Some(version) = &metadata.clr_version {
            writeln!(f, "CLR version: {version}")?;
        } else if metadata.clr_loaded {
            writeln!(f, "CLR version: unknown")?;
        }
        if let Some(time) = &metadata.creation_time {
            writeln!(f, "Dump created: {time}")?;
        }
        let info = &self.target_info;
        let fields = [
            ("Operating system", &info.os_info),
            ("Computer name", &info.computer_name),
            ("User name", &info.user_name),
            ("Process ID", &info.process_id),
            ("Command line", &info.command_line),
        ];
        for (label, value) in fields {
            if let Some(value) = value {
                writeln!(f, "{label}: {value}")?;
            }
        }
        writeln!(f)?;

        if !self.notes.is_empty() {
            writeln!(f, "Notes:")?;
            for note in &self.notes {
                writeln!(f, "  * {note}")?;
            }
            writeln!(f)?;
        }

        self.print_exception(f, width)?;

        if let Some(thread) = self.fault_thread() {
            writeln!(f, "Thread {} ({}) (crashed)", thread.index, thread.os_thread_id)?;
            self.print_frames(f, thread)?;
            writeln!(f)?;
        }

        // We're done if this is a brief report!
        if brief {
            return Ok(());
        }

        writeln!(
            f,
            "All threads ({}) grouped by call stack:",
            self.threads.len()
        )?;
        for group in &self.thread_groups {
            let indices: Vec<String> = group.threads.iter().map(usize::to_string).collect();
            write!(
                f,
                "{} {}",
                if group.threads.len() > 1 { "Threads" } else { "Thread" },
                indices.join(", ")
            )?;
            if group.threads.iter().any(|&index| self.is_fault_thread(index)) {
                write!(f, " (crashed)")?;
            }
            writeln!(f)?;
            let first = group
                .threads
                .first()
                .and_then(|&index| self.threads.iter().find(|thread| thread.index == index));
            if let Some(thread) = first {
                self.print_frames(f, thread)?;
            }
            writeln!(f)?;
        }

        write!(
            f,
            "
Loaded modules:
"
        )?;
        for module in &self.modules {
            write!(
                f,
                "0x{} - 0x{}  {}  {}",
                module.display_start(),
                module.display_end(),
                module.name,
                module.version().unwrap_or("???")
            )?;
            if !module.symbol_status.is_empty() {
                write!(f, "  ({})", module.symbol_status)?;
            }
            writeln!(f)?;
        }

        if !self.target_info.environment.is_empty() {
            write!(
                f,
                "
Environment variables:
"
            )?;
            for (name, value) in &self.target_info.environment {
                writeln!(f, "  {name}={value}")?;
            }
        }
        Ok(())
    }

    fn print_exception<T: Write>(&self, f: &mut T, width: PointerWidth) -> io::Result<()> {
        let exception = &self.exception;
        if !exception.found() {
            writeln!(f, "No exception found.")?;
            writeln!(f)?;
            return Ok(());
        }
        if let Some(description) = &exception.description {
            writeln!(f, "Exception: {description}")?;
        }
        if let Some(code) = &exception.code {
            writeln!(f, "Exception code: {code}")?;
        }
        if exception.address != 0 {
            writeln!(f, "Exception address: {}", format_address(exception.address, width))?;
        }
        if let Some(module) = &exception.module {
            writeln!(f, "Module: {module}")?;
        }
        if let Some(frame) = &exception.frame {
            writeln!(f, "Frame: {frame}")?;
        }
        match &exception.outcome {
            FaultOutcome::Resolved { thread, strategy } => {
                writeln!(f, "Faulting thread: {thread} (found by: {strategy})")?
            }
            FaultOutcome::Ambiguous { candidates } => {
                let candidates: Vec<String> = candidates.iter().map(usize::to_string).collect();
                writeln!(
                    f,
                    "Faulting thread: unknown, one of {}",
                    candidates.join(", ")
                )?
            }
            FaultOutcome::Unresolved | FaultOutcome::NoException => {
                writeln!(f, "Faulting thread: unknown")?
            }
        }
        writeln!(f)
    }

    fn print_frames<T: Write>(&self, f: &mut T, thread: &ThreadRecord) -> io::Result<()> {
        if thread.frames.is_empty() {
            writeln!(f, "<no frames>")?;
        }
        for frame in &thread.frames {
            write!(f, "{:2}  {}", frame.ordinal, frame.call_site)?;
            if frame.inline {
                write!(f, " (inline)")?;
            }
            if self.is_source_frame(frame) {
                write!(f, "  <-- source")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }

    /// Write a machine-readable description of the process state to `f`.
    pub fn print_json<T: Write>(&self, f: &mut T, pretty: bool) -> Result<(), serde_json::Error> {
        let width = self.pointer_width();
        let exception = &self.exception;
        let json_hex = |text: &str| parse_hex(text).map(|address| format_address(address, width));

        let output = json!({
            // OK | the name of the error that cut the transcript short
            "status": self.error.map_or("OK", |error| error.name()),
            "error": self.error.map(|error| error.to_string()),
            "dump_info": {
                "architecture": self.metadata.architecture,
                "pointer_width": width.bits(),
                "wow64": self.metadata.wow64,
                "clr_loaded": self.metadata.clr_loaded,
                "clr_version": self.metadata.clr_version,
                "creation_time": self.metadata.creation_time,
            },
            "target_info": self.target_info,
            "notes": self.notes,
            "exception": {
                "found": exception.found(),
                "heap_corruption": exception.heap_corruption,
                "address": (exception.address != 0).then(|| format_address(exception.address, width)),
                "code": exception.code,
                "description": exception.description,
                "module": exception.module,
                "frame": exception.frame,
                // thread index | null
                "faulting_thread": exception.thread(),
                "found_by": exception.strategy(),
                "outcome": exception.outcome,
            },
            "needs_exception_record": self.needs_exception_record(),
            "recovery_script": self.recovery_script.as_ref().map(|script| json!({
                "strategy": script.strategy,
                "thread": script.thread,
                "argument": script.argument,
            })),
            "thread_count": self.threads.len(),
            "threads": self.threads.iter().map(|thread| json!({
                "index": thread.index,
                "os_thread_id": thread.os_thread_id,
                "crashed": self.is_fault_thread(thread.index),
                "instruction_pointer": thread.instruction_pointer.as_deref().and_then(json_hex),
                "frame_count": thread.frames.len(),
                "frames": thread.frames.iter().map(|frame| json!({
                    "frame": frame.ordinal,
                    "inline": frame.inline,
                    "child_sp": frame.child_sp.as_deref().and_then(json_hex),
                    "return_address": frame.return_address.as_deref().and_then(json_hex),
                    "args": frame.args,
                    "call_site": frame.call_site,
                    "module": frame.module,
                    "function": frame.function,
                    "file": frame.file,
                    "line": frame.line,
                    "source_root": self.is_source_frame(frame),
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "thread_groups": self.thread_groups.iter().map(|group| &group.threads).collect::<Vec<_>>(),
            "managed_threads": self.managed_threads,
            "modules": self.modules.iter().map(|module| json!({
                "name": module.name,
                "base_addr": module.display_start(),
                "end_addr": module.display_end(),
                "symbol_status": module.symbol_status,
                "symbol_path": (!module.symbol_path.is_empty()).then_some(&module.symbol_path),
                "image_path": module.image_path,
                "image_name": module.image_name,
                "timestamp": module.time,
                "version": module.version(),
                "description": module.description,
            })).collect::<Vec<_>>(),
        });

        if pretty {
            serde_json::to_writer_pretty(f, &output)
        } else {
            serde_json::to_writer(f, &output)
        }
    }
}
