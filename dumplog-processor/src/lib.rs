// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for working out what happened in a crash from a debugger's
//! transcript of the crash dump.
//!
//! Use the [dumplog] crate to read a transcript into a
//! [`Transcript`](dumplog::Transcript), then call [`process_transcript`] to
//! join its sections, find the faulting thread and get a [`ProcessState`]
//! that can be printed for humans or as JSON.
//!
//! When the transcript has no usable exception record,
//! [`ProcessState::recovery_script`] holds a debugger script that can
//! recover it in a second debugger session. The output of that session is
//! read with [`dumplog::parse_exception_record`] and swapped in with
//! [`Transcript::with_exception_record`](dumplog::Transcript::with_exception_record)
//! before processing again.
//!
//! [`process_transcript`]: fn.process_transcript.html

#![deny(missing_debug_implementations)]

mod correlator;
mod process_state;
mod processor;
mod recovery;
mod resolver;

pub use correlator::*;
pub use process_state::*;
pub use processor::*;
pub use recovery::*;
pub use resolver::*;
