// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Splitting a transcript into its sections.
//!
//! The debugger script echoes a marker line (`>>> SECTION NAME`) before the
//! output of each group of commands. Every line of the transcript ends up in
//! exactly one section buffer, in the order it was read.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, trace};

use crate::Error;

/// Every section marker starts with this.
pub const SECTION_MARK: &str = ">>> ";

/// A section of a debugger transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// Everything before the first marker: architecture, runtime and session time.
    Preamble,
    TargetInfo,
    ManagedThreads,
    ManagedStacks,
    ExceptionRecord,
    Heap,
    InstructionPointers,
    ThreadStacks,
    LoadedModules,
}

/// The recognized markers in match order.
///
/// A marker line is compared against each entry in turn and the first entry
/// it contains wins. `None` marks the end of the log, which only closes the
/// current section. The empty marker names
/// the preamble and is never matched against marker lines.
pub const SECTION_TABLE: &[(&str, Option<Section>)] = &[
    ("", Some(Section::Preamble)),
    (">>> TARGET INFO", Some(Section::TargetInfo)),
    (">>> MANAGED THREADS", Some(Section::ManagedThreads)),
    (">>> MANAGED STACKS", Some(Section::ManagedStacks)),
    (">>> EXCEPTION RECORD", Some(Section::ExceptionRecord)),
    (">>> EXCEPTION INFO", Some(Section::ExceptionRecord)),
    (">>> HEAP", Some(Section::Heap)),
    (">>> INSTRUCTION POINTERS", Some(Section::InstructionPointers)),
    (">>> THREAD STACKS", Some(Section::ThreadStacks)),
    (">>> LOADED MODULES", Some(Section::LoadedModules)),
    (">>> END OF LOG", None),
];

/// What a line carrying [`SECTION_MARK`] announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    Section(Section),
    EndOfLog,
    Unrecognized,
}

impl Marker {
    /// Classify a line, or `None` if it isn't a marker line at all.
    pub fn classify(line: &str) -> Option<Marker> {
        if !line.contains(SECTION_MARK) {
            return None;
        }
        let marker = SECTION_TABLE
            .iter()
            .filter(|(text, _)| !text.is_empty())
            .find(|(text, _)| line.contains(text));
        Some(match marker {
            Some((_, Some(section))) => Marker::Section(*section),
            Some((_, None)) => Marker::EndOfLog,
            None => Marker::Unrecognized,
        })
    }
}

/// A transcript split into per-section line buffers.
#[derive(Clone, Debug, Default)]
pub struct Sections {
    buffers: BTreeMap<Section, Vec<String>>,
}

impl Sections {
    /// Route an already decoded transcript.
    ///
    /// Lines before the first marker belong to the preamble. Lines after a
    /// marker that isn't recognized, or after the end-of-log marker, are
    /// dropped until the next recognized marker.
    pub fn route<I, S>(lines: I) -> Sections
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut buffers: BTreeMap<Section, Vec<String>> = BTreeMap::new();
        let mut current = Some(Section::Preamble);
        for line in lines {
            let line = line.as_ref();
            match Marker::classify(line) {
                Some(Marker::Section(section)) => {
                    trace!("section marker {:?}: {}", section, line);
                    current = Some(section);
                }
                Some(Marker::EndOfLog) => {
                    trace!("end of log marker");
                    current = None;
                }
                Some(Marker::Unrecognized) => {
                    debug!("ignoring lines after unrecognized marker: {}", line);
                    current = None;
                }
                None => {
                    if let Some(section) = current {
                        buffers.entry(section).or_default().push(line.to_owned());
                    }
                }
            }
        }
        Sections { buffers }
    }

    /// Read and route the transcript at `path`.
    pub fn read_path<P>(path: P) -> Result<Sections, Error>
    where
        P: AsRef<Path>,
    {
        Ok(Sections::route(read_lines(path)?))
    }

    /// The lines of `section`, empty if the transcript never had it.
    pub fn lines(&self, section: Section) -> &[String] {
        self.buffers
            .get(&section)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the transcript had any lines for `section`.
    pub fn has(&self, section: Section) -> bool {
        !self.lines(section).is_empty()
    }
}

/// Read the text lines of a debugger log.
///
/// The debugger writes its log as UTF-16 with a byte order mark. Files
/// without one are decoded as UTF-8, replacing anything malformed.
pub fn read_lines<P>(path: P) -> Result<Vec<String>, Error>
where
    P: AsRef<Path>,
{
    let bytes = fs::read(path.as_ref()).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::FileNotFound,
        _ => Error::IoError,
    })?;
    let (text, encoding, had_errors) = encoding_rs::UTF_8.decode(&bytes);
    if had_errors {
        debug!("replaced malformed {} sequences in {}", encoding.name(), path.as_ref().display());
    }
    Ok(text.lines().map(str::to_owned).collect())
}
