// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Facts about the dump from the transcript's preamble.

use serde::Serialize;
use tracing::{debug, trace};

use crate::utils::normalize_session_time;
use crate::Error;

/// The width of a pointer in the dumped process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum PointerWidth {
    Bits32,
    #[default]
    Bits64,
}

impl PointerWidth {
    pub fn bits(self) -> u32 {
        match self {
            PointerWidth::Bits32 => 32,
            PointerWidth::Bits64 => 64,
        }
    }

    /// Number of hex digits in a full address.
    pub fn hex_digits(self) -> usize {
        match self {
            PointerWidth::Bits32 => 8,
            PointerWidth::Bits64 => 16,
        }
    }
}

/// Architecture and runtime information about the dumped process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DumpMetadata {
    /// The effective machine the debugger reported, e.g. `AMD64` or `x86`.
    pub architecture: String,
    /// The dump holds a 32-bit process running under WOW64.
    pub wow64: bool,
    /// The debugger loaded the managed-runtime (SOS) extension.
    pub clr_loaded: bool,
    pub clr_version: Option<String>,
    /// When the dump was written, as RFC 3339 in UTC when it could be parsed.
    pub creation_time: Option<String>,
}

impl DumpMetadata {
    /// Whether the dumped process is 32-bit or 64-bit.
    pub fn pointer_width(&self) -> PointerWidth {
        if self.wow64 || self.architecture.eq_ignore_ascii_case("x86") {
            PointerWidth::Bits32
        } else {
            PointerWidth::Bits64
        }
    }
}

/// Extract the dump metadata, failing if no architecture was reported.
///
/// Without the architecture none of the architecture-dependent sections
/// can be read, so this is the one fatal condition of a transcript.
pub fn parse_metadata(lines: &[String]) -> Result<DumpMetadata, Error> {
    let metadata = scan_metadata(lines);
    if metadata.architecture.is_empty() {
        return Err(Error::MissingArchitecture);
    }
    Ok(metadata)
}

/// Extract whatever metadata the preamble has.
pub fn scan_metadata(lines: &[String]) -> DumpMetadata {
    let mut metadata = DumpMetadata::default();
    let mut lines = lines.iter();
    while let Some(line) = lines.next() {
        if line.contains("Effective machine") {
            if let Some(architecture) = effective_machine(line) {
                trace!("effective machine: {}", architecture);
                metadata.architecture = architecture.to_owned();
            }
        } else if line.contains("WOW64 found") {
            metadata.wow64 = true;
        } else if line.contains("Automatically loaded SOS Extension") {
            metadata.clr_loaded = true;
        } else if let Some(time) = session_time(line) {
            metadata.creation_time = Some(time);
        } else if line.contains("eeversion") {
            // The rest of the preamble is the command's output; the last
            // version printed wins.
            metadata.clr_version = lines.by_ref().filter_map(|line| runtime_version(line)).last();
            if metadata.clr_version.is_none() {
                debug!("no runtime version after eeversion");
            }
        }
    }
    metadata
}

/// Find the debug session time in any section's lines.
///
/// Depending on how the debugger was started, the session time is printed
/// before the first marker or only by the target information commands.
pub fn find_session_time(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| session_time(line))
}

fn session_time(line: &str) -> Option<String> {
    let (_, time) = line.split_once("Debug session time:")?;
    Some(normalize_session_time(time))
}

// `Effective machine: x64 (AMD64)` -> `AMD64`
fn effective_machine(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("Effective machine:")?;
    let open = rest.rfind('(')?;
    if open == 0 {
        return None;
    }
    let inner = &rest[open + 1..];
    let close = inner.rfind(')')?;
    let token = inner[..close].trim();
    (!token.is_empty()).then_some(token)
}

// The one four-part dotted version number on a line, if there is exactly one.
fn runtime_version(line: &str) -> Option<String> {
    let mut versions = line
        .split(|c: char| !c.is_ascii_digit() && c != '.')
        .filter(|token| {
            let parts: Vec<&str> = token.split('.').collect();
            parts.len() == 4 && parts.iter().all(|part| !part.is_empty())
        });
    let version = versions.next()?;
    if versions.next().is_some() {
        return None;
    }
    Some(version.to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn test_effective_machine() {
        assert_eq!(effective_machine("Effective machine: x64 (AMD64)"), Some("AMD64"));
        assert_eq!(
            effective_machine("Effective machine: x86 compatible (x86)"),
            Some("x86")
        );
        assert_eq!(effective_machine("Effective machine:(AMD64)"), None);
        assert_eq!(effective_machine("Effective machine: x64 ()"), None);
    }

    #[test]
    fn test_runtime_version() {
        assert_eq!(
            runtime_version("4.8.4180.0 retail").as_deref(),
            Some("4.8.4180.0")
        );
        assert_eq!(runtime_version("SOS Version: 1.2"), None);
        assert_eq!(runtime_version("1.2.3.4 and 5.6.7.8"), None);
    }

    #[test]
    fn test_scan_metadata() {
        let metadata = scan_metadata(&lines(
            "Debug session time: Thu Mar 14 10:22:33.000 2019 (UTC + 1:00)
Automatically loaded SOS Extension
Effective machine: x64 (AMD64)
> !eeversion
PDB symbol for clr.dll not loaded
4.8.4180.0 retail
Workstation mode
SOS Version: 4.8.4180.0 retail build",
        ));
        assert_eq!(metadata.architecture, "AMD64");
        assert!(metadata.clr_loaded);
        assert!(!metadata.wow64);
        assert_eq!(metadata.clr_version.as_deref(), Some("4.8.4180.0"));
        assert!(metadata
            .creation_time
            .as_deref()
            .unwrap()
            .starts_with("2019-03-14T09:22:33"));
        assert_eq!(metadata.pointer_width(), PointerWidth::Bits64);
    }

    #[test]
    fn test_last_runtime_version_wins() {
        let metadata = scan_metadata(&lines(
            "Effective machine: x64 (AMD64)
> !eeversion
4.7.3190.0 retail
Workstation mode
In plan phase of garbage collection
SOS Version: 4.8.4180.0 retail build
Loaded 2 modules, 1.2.3.4 and 5.6.7.8",
        ));
        // The last line has two versions, so it doesn't count.
        assert_eq!(metadata.clr_version.as_deref(), Some("4.8.4180.0"));
    }

    #[test]
    fn test_wow64_is_32_bit() {
        let metadata = scan_metadata(&lines(
            "WOW64 found
Effective machine: x64 (AMD64)",
        ));
        assert!(metadata.wow64);
        assert_eq!(metadata.pointer_width(), PointerWidth::Bits32);

        let metadata = scan_metadata(&lines("Effective machine: x86 compatible (x86)"));
        assert_eq!(metadata.pointer_width(), PointerWidth::Bits32);
    }

    #[test]
    fn test_missing_architecture() {
        assert_eq!(
            parse_metadata(&lines("WOW64 found")).unwrap_err(),
            Error::MissingArchitecture
        );
    }
}
