// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::exception::{parse_exception_record, parse_heap_corruption, ExceptionRecord, HeapCorruption};
use crate::managed::{parse_managed_stacks, parse_managed_threads, ManagedStackRecord, ManagedThreadRecord};
use crate::metadata::{find_session_time, parse_metadata, scan_metadata, DumpMetadata, PointerWidth};
use crate::modules::{parse_modules, ModuleRecord};
use crate::registers::parse_instruction_pointers;
use crate::router::{Section, Sections};
use crate::target_info::{parse_target_info, TargetInfo};
use crate::threads::{parse_thread_stacks, ThreadRecord};

/// Everything read from a debugger transcript.
///
/// The `Transcript` holds the typed contents of each section, exactly as
/// the debugger reported them. Nothing here is joined across sections;
/// that is the job of the processor. It can be built by calling
/// [`Transcript::read_path`][read_path] or, for already routed lines,
/// [`Transcript::from_sections`][from_sections].
///
/// # Examples
///
/// ```
/// use dumplog::Transcript;
///
/// # fn foo() -> Result<(), dumplog::Error> {
/// let transcript = Transcript::read_path("../testdata/x64-managed.log")?;
/// println!("{} threads", transcript.threads.len());
/// # Ok(())
/// # }
/// ```
///
/// [read_path]: struct.Transcript.html#method.read_path
/// [from_sections]: struct.Transcript.html#method.from_sections
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    pub metadata: DumpMetadata,
    pub target_info: TargetInfo,
    pub managed_threads: Vec<ManagedThreadRecord>,
    pub managed_stacks: Vec<ManagedStackRecord>,
    pub exception_record: ExceptionRecord,
    pub heap_corruption: Option<HeapCorruption>,
    /// One per thread, in the order the threads were printed.
    pub instruction_pointers: Vec<String>,
    pub threads: Vec<ThreadRecord>,
    pub modules: Vec<ModuleRecord>,
}

/// Errors encountered while reading a `Transcript`.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error")]
    IoError,
    #[error("The debugger's log has an invalid format (no effective machine found)")]
    MissingArchitecture,
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError => "IoError",
            Error::MissingArchitecture => "MissingArchitecture",
        }
    }
}

impl Transcript {
    /// Read and parse the transcript at `path`.
    pub fn read_path<P>(path: P) -> Result<Transcript, Error>
    where
        P: AsRef<Path>,
    {
        Transcript::from_sections(&Sections::read_path(path)?)
    }

    /// Parse already decoded transcript lines.
    pub fn from_lines<I, S>(lines: I) -> Result<Transcript, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Transcript::from_sections(&Sections::route(lines))
    }

    /// Parse each section of a routed transcript.
    ///
    /// Fails only if the preamble doesn't say what architecture the dump
    /// is, since the stack layouts depend on it.
    pub fn from_sections(sections: &Sections) -> Result<Transcript, Error> {
        let mut metadata = parse_metadata(sections.lines(Section::Preamble))?;
        if metadata.creation_time.is_none() {
            metadata.creation_time = find_session_time(sections.lines(Section::TargetInfo));
        }
        let width = metadata.pointer_width();
        debug!(
            "reading a {}-bit transcript ({})",
            width.bits(),
            metadata.architecture
        );
        let threads = parse_thread_stacks(sections.lines(Section::ThreadStacks), width);
        if threads.is_empty() {
            warn!("the transcript has no thread stacks");
        }
        Ok(Transcript {
            metadata,
            threads,
            exception_record: parse_exception_record(
                sections.lines(Section::ExceptionRecord),
                width,
            ),
            ..Transcript::architecture_independent(sections)
        })
    }

    /// Parse what can be read from a transcript that has no architecture.
    ///
    /// This is for reporting on a transcript that
    /// [`from_sections`][Transcript::from_sections] rejected: it has the
    /// target information, modules and managed data, but no native stacks.
    pub fn partial(sections: &Sections) -> Transcript {
        let mut exception_record = parse_exception_record(
            sections.lines(Section::ExceptionRecord),
            PointerWidth::default(),
        );
        exception_record.call_stack = None;
        let mut metadata = scan_metadata(sections.lines(Section::Preamble));
        if metadata.creation_time.is_none() {
            metadata.creation_time = find_session_time(sections.lines(Section::TargetInfo));
        }
        Transcript {
            metadata,
            exception_record,
            ..Transcript::architecture_independent(sections)
        }
    }

    fn architecture_independent(sections: &Sections) -> Transcript {
        Transcript {
            target_info: parse_target_info(sections.lines(Section::TargetInfo)),
            managed_threads: parse_managed_threads(sections.lines(Section::ManagedThreads)),
            managed_stacks: parse_managed_stacks(sections.lines(Section::ManagedStacks)),
            heap_corruption: parse_heap_corruption(sections.lines(Section::Heap)),
            instruction_pointers: parse_instruction_pointers(
                sections.lines(Section::InstructionPointers),
            ),
            modules: parse_modules(sections.lines(Section::LoadedModules)),
            ..Transcript::default()
        }
    }

    /// Replace the exception record, e.g. with one a recovery script
    /// obtained in a second debugger session.
    pub fn with_exception_record(self, exception_record: ExceptionRecord) -> Transcript {
        Transcript {
            exception_record,
            ..self
        }
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.metadata.pointer_width()
    }

    /// The thread with the debugger's thread number `index`.
    pub fn thread(&self, index: usize) -> Option<&ThreadRecord> {
        self.threads.iter().find(|thread| thread.index == index)
    }
}
