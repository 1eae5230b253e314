// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::path::{Path, PathBuf};

use dumplog::*;

fn locate_testdata() -> PathBuf {
    // Tests run from the crate root, but `cargo test --all` may also run
    // them from the workspace root.
    let paths = &[Path::new("testdata"), Path::new("../testdata")];
    for path in paths {
        if path.is_dir() {
            return path.to_path_buf();
        }
    }

    panic!("Couldn't find testdata directory! Tried: {:?}", paths);
}

fn read_test_transcript(name: &str) -> Result<Transcript, Error> {
    let path = locate_testdata().join(name);
    println!("transcript: {:?}", path);
    Transcript::read_path(&path)
}

#[test]
fn test_sections() {
    let sections = Sections::read_path(locate_testdata().join("x64-managed.log")).unwrap();
    for section in [
        Section::Preamble,
        Section::TargetInfo,
        Section::ManagedThreads,
        Section::ManagedStacks,
        Section::ExceptionRecord,
        Section::InstructionPointers,
        Section::ThreadStacks,
        Section::LoadedModules,
    ] {
        assert!(sections.has(section), "missing {:?}", section);
    }
    assert!(!sections.has(Section::Heap));
    // Nothing after the end marker is kept.
    let modules = sections.lines(Section::LoadedModules);
    assert!(modules
        .iter()
        .all(|line| !line.contains("Closing open log file")));
    // Line endings are gone.
    assert!(sections
        .lines(Section::Preamble)
        .iter()
        .all(|line| !line.ends_with('\r')));
}

#[test]
fn test_managed_transcript() {
    let transcript = read_test_transcript("x64-managed.log").unwrap();
    assert_eq!(transcript.pointer_width(), PointerWidth::Bits64);
    assert_eq!(transcript.metadata.architecture, "AMD64");
    assert!(!transcript.metadata.wow64);
    assert!(transcript.metadata.clr_loaded);

    assert_eq!(transcript.threads.len(), 3);
    let thread = transcript.thread(2).unwrap();
    assert_eq!(thread.os_thread_id, "1b24");
    assert_eq!(thread.frames.len(), 4);
    assert_eq!(thread.frames[3].child_sp.as_deref(), Some("000000d0f8fffa30"));
    // Instruction pointers are joined to threads by the processor.
    assert_eq!(thread.instruction_pointer, None);
    assert_eq!(
        transcript.instruction_pointers,
        vec!["00007ffb1c8aa839", "00007ffb1f6a4fd4", "00007ffb1f6a4fd4"]
    );

    assert_eq!(transcript.managed_threads.len(), 2);
    let managed = &transcript.managed_threads[0];
    assert_eq!(managed.thread_index, 0);
    assert_eq!(managed.managed_index, 1);
    assert_eq!(managed.os_thread_id, "2d8c");
    assert_eq!(managed.gc_mode, "Preemptive");
    assert_eq!(managed.apartment, "MTA");
    assert!(managed.reports_exception());

    // Thread 1 has no managed frames and thread 2's walk failed.
    assert_eq!(transcript.managed_stacks.len(), 1);
    let stack = &transcript.managed_stacks[0];
    assert_eq!(stack.os_thread_id, "0x2d8c");
    assert_eq!(stack.frames.len(), 4);
    assert_eq!(stack.frames[1].child_sp, "000000d0f8bfeb20");
    assert_eq!(
        stack.frames[1].call_site,
        r"ConsoleApp.Program.Crash(Int32) [C:\src\ConsoleApp\Program.cs @ 20]"
    );

    let record = &transcript.exception_record;
    assert!(record.is_present());
    assert!(record.is_clr_exception);
    assert_eq!(record.address, 0x7ffb_1c8a_a839);
    assert_eq!(record.description.as_deref(), Some("CLR exception"));
    assert_eq!(record.call_stack, None);
    assert_eq!(transcript.heap_corruption, None);

    assert_eq!(transcript.modules.len(), 5);
    assert!(transcript
        .modules
        .iter()
        .all(|module| !module.name.starts_with("api_ms_win")));
    let clr = &transcript.modules[1];
    assert_eq!(clr.symbol_status, "deferred");
    assert_eq!(clr.symbol_path, "");
    assert_eq!(
        clr.description.as_deref(),
        Some("Microsoft .NET Runtime Common Language Runtime - WorkStation")
    );
}

#[test]
fn test_exception_thread() {
    let transcript = read_test_transcript("x64-heap.log").unwrap();
    let reported = transcript.exception_record.call_stack.as_ref().unwrap();
    assert_eq!(reported.index, 0);
    assert_eq!(reported.os_thread_id, "3a5c");
    assert_eq!(reported.frames.len(), 10);
    assert_eq!(transcript.exception_record.code.as_deref(), Some("c0000374"));
    assert_eq!(transcript.exception_record.description, None);

    let heap = transcript.heap_corruption.as_ref().unwrap();
    assert_eq!(heap.error_type, "HEAP_FAILURE_BLOCK_NOT_BUSY");
    assert_eq!(
        heap.stack,
        vec![
            0x7ffb_1f6f_4a8a,
            0x7ffb_1f6a_2c1d,
            0x7ffb_1f6a_1f5e,
            0x7ffb_1c5f_9b2c,
            0x7ff6_4e1c_1a2a,
        ]
    );
    assert_eq!(
        transcript.metadata.creation_time.as_deref(),
        Some("2024-01-10T13:15:42Z")
    );
}

#[test]
fn test_32bit_transcript() {
    let transcript = read_test_transcript("x86-native.log").unwrap();
    assert_eq!(transcript.pointer_width(), PointerWidth::Bits32);
    assert!(!transcript.metadata.clr_loaded);
    assert!(transcript.managed_threads.is_empty());
    assert!(transcript.managed_stacks.is_empty());

    let thread = transcript.thread(0).unwrap();
    assert_eq!(thread.frames.len(), 10);
    let filter = &thread.frames[2];
    assert_eq!(filter.function, "UnhandledExceptionFilter+0x1a5 (FPO: [Non-Fpo])");
    assert_eq!(filter.args, vec!["0019f4dc", "0019f5a4", "00000000"]);
    assert!(transcript.thread(1).unwrap().has_return_address(0x0040_1a2b));
    assert!(!transcript.thread(2).unwrap().has_return_address(0x0040_1a2b));

    let info = &transcript.target_info;
    assert_eq!(info.user_name.as_deref(), Some("builder"));
    assert_eq!(
        info.os_info.as_deref(),
        Some("Windows 7 Version 7601 (Service Pack 1) MP (4 procs)")
    );
    assert_eq!(info.environment.len(), 3);
}

#[test]
fn test_missing_record() {
    let transcript = read_test_transcript("x86-unhandled.log").unwrap();
    // A zero address means the dump has no record; the code after it is
    // not kept.
    assert_eq!(transcript.exception_record, ExceptionRecord::default());
}

#[test]
fn test_recovered_record() {
    let lines = read_lines(locate_testdata().join("exr-recovered.log")).unwrap();
    let record = parse_exception_record(&lines, PointerWidth::Bits32);
    assert_eq!(record.address, 0x0040_1a2b);
    assert_eq!(record.module.as_deref(), Some("NativeApp"));
    assert_eq!(record.code.as_deref(), Some("c0000005"));
    assert_eq!(record.description.as_deref(), Some("Access violation"));
}

#[test]
fn test_missing_architecture() {
    assert_eq!(
        read_test_transcript("no-effmach.log").unwrap_err(),
        Error::MissingArchitecture
    );
    assert_eq!(
        read_test_transcript("does-not-exist.log").unwrap_err(),
        Error::FileNotFound
    );
}
