// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::boxed::Box;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::panic;
use std::path::Path;

use dumplog::{parse_exception_record, read_lines, PointerWidth, Sections, Transcript};
use dumplog_processor::{main_script, ProcessState, ProcessorOptions, INIT_SCRIPT};

use clap::{AppSettings, Arg, ArgGroup, Command};
use log::{error, warn};
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

fn make_app() -> Command<'static> {
    Command::new("dumplog-stackwalk")
        .version(clap::crate_version!())
        .about("Analyzes debugger transcripts of crash dumps and produces a report (either human-readable or JSON).")
        .next_line_help(true)
        .setting(AppSettings::DeriveDisplayOrder)
        .override_usage("dumplog-stackwalk [FLAGS] [OPTIONS] <transcript>")
        .arg(Arg::new("json").long("json").help("Emit a machine-readable JSON report."))
        .arg(Arg::new("human").long("human").long_help(
            "Emit a human-readable report (the default).

The human-readable report does not have a specified format, and may not have as \
many details as the JSON format.",
        ))
        .arg(
            Arg::new("print-script")
                .long("print-script")
                .takes_value(true)
                .possible_values(&["init", "main-x86", "main-x64"])
                .long_help(
                    "Print one of the debugger scripts that produce a transcript and exit.

The init script probes whether the dump holds a WOW64 process; the main script \
for the dump's architecture then writes the transcript. Both write their output \
to the `[LOG_FILE]` placeholder, which must be replaced before running them.",
                ),
        )
        .group(ArgGroup::new("output-format").args(&["json", "human", "print-script"]))
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write the output to (if unspecified, stdout is used)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write logs to (if unspecified, stderr is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .takes_value(true)
                .long_help(
                    "Set the logging level.

Every line the transcript reader skips is logged at `trace`, so --verbose=trace \
is the way to find out why a section came out empty.",
                ),
        )
        .arg(
            Arg::new("pretty")
                .long("pretty")
                .help("Pretty-print --json output."),
        )
        .arg(Arg::new("brief").long("brief").help(
            "Provide a briefer --human report.

Only provides the top-level summary and a backtrace of the faulting thread.",
        ))
        .arg(
            Arg::new("symbol-folder")
                .long("symbol-folder")
                .takes_value(true)
                .long_help(
                    "The folder the application's symbols should have been loaded from.

The report carries a note when no module's symbols came from it.",
                ),
        )
        .arg(
            Arg::new("source-root")
                .long("source-root")
                .takes_value(true)
                .help("Mark the frames whose source files are under this folder."),
        )
        .arg(
            Arg::new("debugger-bits")
                .long("debugger-bits")
                .takes_value(true)
                .possible_values(&["32", "64"])
                .long_help(
                    "The bitness of the debugger that wrote the transcript.

The report carries a note when it doesn't match the dump's.",
                ),
        )
        .arg(
            Arg::new("exception-record")
                .long("exception-record")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "The output of a recovery script run against the same dump.

The exception record it prints replaces the transcript's own.",
                ),
        )
        .arg(
            Arg::new("recovery-script")
                .long("recovery-script")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "Where to write a script that recovers the exception record.

The script is only written when the transcript has no usable exception \
record and the call stacks show where to find it. Run it against the dump \
and pass its output back with --exception-record.",
                ),
        )
        .arg(
            Arg::new("recovery-log")
                .long("recovery-log")
                .takes_value(true)
                .requires("recovery-script")
                .help("The log file the recovery script writes to (if unspecified, `[LOG_FILE]` is left in)"),
        )
        .arg(
            Arg::new("transcript")
                .required_unless_present("print-script")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Path to the debugger transcript to analyze."),
        )
}

#[cfg_attr(test, allow(dead_code))]
fn main() {
    let matches = make_app().get_matches();

    let output_file = matches
        .value_of_os("output-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let log_file = matches
        .value_of_os("log-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let verbosity = match matches.value_of("verbose") {
        Some("off") => LevelFilter::Off,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    // Init the logger (and make trace logging less noisy)
    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_time_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_level_color(Level::Trace, None)
        .build();
    match log_file.map(File::create) {
        Some(Ok(log_file)) => {
            let _ = WriteLogger::init(verbosity, config, log_file);
        }
        Some(Err(err)) => {
            let _ = TermLogger::init(verbosity, config, TerminalMode::Stderr, ColorChoice::Auto);
            error!("Error creating log file: {}", err);
            std::process::exit(1);
        }
        None => {
            let _ = TermLogger::init(verbosity, config, TerminalMode::Stderr, ColorChoice::Auto);
        }
    }

    // Set a panic hook to redirect to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));

    let mut stdout;
    let mut output_f;
    let output: &mut dyn Write = if let Some(output_path) = output_file {
        output_f = match File::create(&output_path) {
            Ok(file) => file,
            Err(err) => {
                error!("Error creating {}: {}", output_path.display(), err);
                std::process::exit(1);
            }
        };
        &mut output_f
    } else {
        stdout = std::io::stdout();
        &mut stdout
    };

    if let Some(script) = matches.value_of("print-script") {
        let script = match script {
            "init" => INIT_SCRIPT.to_owned(),
            "main-x86" => main_script(PointerWidth::Bits32),
            _ => main_script(PointerWidth::Bits64),
        };
        if let Err(err) = output.write_all(script.as_bytes()) {
            error!("Error writing the script: {}", err);
            std::process::exit(1);
        }
        return;
    }

    // Now check if arguments that tweak the output are valid. We can't use
    // Arg::requires because clap doesn't understand --human being implicitly enabled.
    let json = matches.is_present("json");
    let pretty = matches.is_present("pretty");
    let brief = matches.is_present("brief");
    if pretty && !json {
        error!("Humans must be hideous! (The --pretty flag is only valid for --json output)");
        std::process::exit(1);
    }
    if brief && json {
        error!("Robots cannot be brief! (The --brief flag is only valid for --human output)");
        std::process::exit(1);
    }

    let mut options = ProcessorOptions::new();
    if let Some(folder) = matches.value_of("symbol-folder") {
        options = options.symbol_folder(folder);
    }
    if let Some(root) = matches.value_of("source-root") {
        options = options.source_root(root);
    }
    match matches.value_of("debugger-bits") {
        Some("32") => options = options.debugger_width(PointerWidth::Bits32),
        Some("64") => options = options.debugger_width(PointerWidth::Bits64),
        _ => {}
    }

    let Some(transcript_path) = matches.value_of_os("transcript").map(Path::new) else {
        error!("No transcript to analyze");
        std::process::exit(1);
    };

    // Ok now let's do the thing!!!!
    let sections = match Sections::read_path(transcript_path) {
        Ok(sections) => sections,
        Err(err) => {
            error!("{} - Error reading transcript: {}", err.name(), err);
            std::process::exit(1);
        }
    };
    let (transcript, read_error) = match Transcript::from_sections(&sections) {
        Ok(transcript) => (transcript, None),
        Err(err) => {
            // Still report what can be read without an architecture.
            error!("{} - Error reading transcript: {}", err.name(), err);
            (Transcript::partial(&sections), Some(err))
        }
    };

    let transcript = match matches.value_of_os("exception-record").map(Path::new) {
        Some(path) => match read_lines(path) {
            Ok(lines) => {
                let record = parse_exception_record(&lines, transcript.pointer_width());
                if record.is_present() {
                    transcript.with_exception_record(record)
                } else {
                    warn!("No exception record in {}", path.display());
                    transcript
                }
            }
            Err(err) => {
                error!("{} - Error reading exception record: {}", err.name(), err);
                std::process::exit(1);
            }
        },
        None => transcript,
    };

    let mut state = dumplog_processor::process_transcript(&transcript, &options);
    if let Some(err) = read_error {
        state = state.with_error(err);
    }

    if let Err(err) = print_state(&state, output, json, pretty, brief) {
        error!("Error writing the report: {}", err);
        std::process::exit(1);
    }

    if let Some(script_path) = matches.value_of_os("recovery-script").map(Path::new) {
        match &state.recovery_script {
            Some(script) => {
                let text = match matches.value_of("recovery-log") {
                    Some(log_file) => script.with_log_file(log_file),
                    None => script.script.clone(),
                };
                if let Err(err) = fs::write(script_path, text) {
                    error!("Error writing {}: {}", script_path.display(), err);
                    std::process::exit(1);
                }
            }
            None if state.needs_exception_record() => {
                warn!("The call stacks don't show where the exception record is")
            }
            None => {}
        }
    }

    if read_error.is_some() {
        std::process::exit(1);
    }
}

fn print_state(
    state: &ProcessState,
    mut output: &mut dyn Write,
    json: bool,
    pretty: bool,
    brief: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        state.print_json(&mut output, pretty)?;
    } else if brief {
        state.print_brief(&mut output)?;
    } else {
        state.print(&mut output)?;
    }
    Ok(())
}
