// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use dumplog::{PointerWidth, Transcript};
use tracing::{debug, info};

use crate::correlator::correlate;
use crate::process_state::ProcessState;
use crate::recovery::select_recovery_script;
use crate::resolver::resolve;

/// Configuration of how a transcript is processed.
///
/// Every field is optional; the default adds no configuration-dependent
/// notes and marks no frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ProcessorOptions {
    /// The folder the dump's symbols are expected to be loaded from. A
    /// note is added when no module's symbols came from it.
    pub symbol_folder: Option<String>,
    /// The pointer width of the debugger that produced the transcript. A
    /// note is added when it doesn't match the dump's.
    pub debugger_width: Option<PointerWidth>,
    /// The root of the application's source tree.
    pub source_root: Option<String>,
}

impl ProcessorOptions {
    pub fn new() -> ProcessorOptions {
        ProcessorOptions::default()
    }

    pub fn symbol_folder(mut self, folder: impl Into<String>) -> ProcessorOptions {
        self.symbol_folder = Some(folder.into());
        self
    }

    pub fn debugger_width(mut self, width: PointerWidth) -> ProcessorOptions {
        self.debugger_width = Some(width);
        self
    }

    pub fn source_root(mut self, root: impl Into<String>) -> ProcessorOptions {
        self.source_root = Some(root.into());
        self
    }
}

/// Correlate the sections of `transcript`, find the faulting thread and
/// return a `ProcessState`.
///
/// Processing never fails: a transcript that lacks some section just
/// produces a state with less in it.
///
/// # Examples
///
/// ```
/// use dumplog::Transcript;
/// use dumplog_processor::ProcessorOptions;
///
/// # fn foo() -> Result<(), dumplog::Error> {
/// let transcript = Transcript::read_path("../testdata/x86-native.log")?;
/// let state = dumplog_processor::process_transcript(&transcript, &ProcessorOptions::default());
/// assert_eq!(state.threads.len(), 3);
/// println!("Faulting thread: {:?}", state.exception.thread());
/// # Ok(())
/// # }
/// # fn main() { foo().unwrap() }
/// ```
pub fn process_transcript(transcript: &Transcript, options: &ProcessorOptions) -> ProcessState {
    let width = transcript.pointer_width();
    let correlation = correlate(transcript, options.symbol_folder.as_deref());
    let exception = resolve(transcript, &correlation.threads);
    info!(
        "processed {} threads, faulting thread {:?}",
        correlation.threads.len(),
        exception.thread()
    );

    let mut notes = correlation.notes;
    if !transcript.metadata.architecture.is_empty() {
        notes.extend(bitness_notes(transcript, options.debugger_width));
    }

    let mut state = ProcessState {
        metadata: transcript.metadata.clone(),
        target_info: transcript.target_info.clone(),
        modules: transcript.modules.clone(),
        managed_threads: transcript.managed_threads.clone(),
        threads: correlation.threads,
        thread_groups: correlation.groups,
        exception,
        notes,
        recovery_script: None,
        source_root: options.source_root.clone(),
        error: None,
    };
    if state.needs_exception_record() {
        state.recovery_script = select_recovery_script(&state.threads, width);
        debug!("exception record recovery: {:?}", state.recovery_script.as_ref().map(|script| script.strategy));
    }
    state
}

fn bitness_notes(transcript: &Transcript, debugger_width: Option<PointerWidth>) -> Vec<String> {
    let mut notes = Vec::new();
    let dump_width = transcript.pointer_width();
    match (dump_width, debugger_width) {
        (PointerWidth::Bits32, Some(PointerWidth::Bits64)) => {
            notes.push(String::from("32-bit dump processed with a 64-bit debugger."))
        }
        (PointerWidth::Bits64, Some(PointerWidth::Bits32)) => {
            notes.push(String::from("64-bit dump processed with a 32-bit debugger."))
        }
        _ => {}
    }
    if transcript.metadata.wow64 {
        notes.push(String::from(
            "64-bit dumps of 32-bit processes may show inaccurate or incomplete stack traces.",
        ));
    }
    notes
}

#[cfg(test)]
mod test {
    use super::*;
    use dumplog::DumpMetadata;

    fn transcript(architecture: &str, wow64: bool) -> Transcript {
        Transcript {
            metadata: DumpMetadata {
                architecture: architecture.to_owned(),
                wow64,
                ..DumpMetadata::default()
            },
            ..Transcript::default()
        }
    }

    #[test]
    fn test_bitness_notes() {
        let notes = bitness_notes(&transcript("x86", false), Some(PointerWidth::Bits64));
        assert_eq!(notes, vec!["32-bit dump processed with a 64-bit debugger."]);

        let notes = bitness_notes(&transcript("AMD64", false), Some(PointerWidth::Bits32));
        assert_eq!(notes, vec!["64-bit dump processed with a 32-bit debugger."]);

        let notes = bitness_notes(&transcript("AMD64", false), None);
        assert!(notes.is_empty());

        // WOW64 dumps are read as 32-bit.
        let notes = bitness_notes(&transcript("AMD64", true), Some(PointerWidth::Bits32));
        assert_eq!(
            notes,
            vec!["64-bit dumps of 32-bit processes may show inaccurate or incomplete stack traces."]
        );
    }

    #[test]
    fn test_options() {
        let options = ProcessorOptions::new()
            .symbol_folder(r"C:\symbols")
            .debugger_width(PointerWidth::Bits64)
            .source_root(r"C:\src");
        assert_eq!(options.symbol_folder.as_deref(), Some(r"C:\symbols"));
        assert_eq!(options.debugger_width, Some(PointerWidth::Bits64));
        assert_eq!(options.source_root.as_deref(), Some(r"C:\src"));
    }

    #[test]
    fn test_empty_transcript() {
        let state = process_transcript(&transcript("AMD64", false), &ProcessorOptions::default());
        assert!(!state.exception.found());
        assert!(state.needs_exception_record());
        assert_eq!(state.recovery_script, None);
        assert_eq!(state.notes, vec!["No thread call stacks were found in the log."]);
    }
}
