// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A parser for the transcripts a Windows debugger writes while analyzing
//! a crash dump.
//!
//! The debugger is driven by a script that echoes a section marker line
//! (`>>> THREAD STACKS`, `>>> LOADED MODULES`, ...) before the output of
//! each group of commands. This crate splits a transcript at those markers
//! and reads each section into typed records. Everything starts with
//! [`Transcript::read_path`]:
//!
//! ```
//! use dumplog::Transcript;
//!
//! # fn foo() -> Result<(), dumplog::Error> {
//! let transcript = Transcript::read_path("../testdata/x86-native.log")?;
//! for thread in &transcript.threads {
//!     println!("thread {} has {} frames", thread.index, thread.frames.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! A transcript whose preamble doesn't name the dump's architecture is
//! rejected with [`Error::MissingArchitecture`]. [`Transcript::partial`]
//! still reads the sections that don't depend on it.
//!
//! See the `dumplog-processor` crate for working out which thread crashed.

#![deny(missing_debug_implementations)]

mod exception;
mod managed;
mod metadata;
mod modules;
mod parsers;
mod registers;
mod router;
mod target_info;
mod threads;
mod transcript;
pub mod utils;

pub use crate::exception::*;
pub use crate::managed::*;
pub use crate::metadata::*;
pub use crate::modules::*;
pub use crate::registers::*;
pub use crate::router::*;
pub use crate::target_info::*;
pub use crate::threads::*;
pub use crate::transcript::*;
