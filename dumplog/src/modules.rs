// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The loaded module list.

use nom::bytes::complete::{take_till, take_until};
use nom::character::complete::{char, space1};
use nom::combinator::verify;
use nom::sequence::{delimited, tuple};
use nom::IResult;
use serde::Serialize;
use tracing::trace;

use crate::parsers::{register_token, value_after, word};
use crate::utils::{format_timestamp, strip_backticks};

/// A module loaded in the dumped process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    pub start_address: String,
    pub end_address: String,
    pub name: String,
    /// What the debugger loaded for the module, e.g. `deferred` or `private pdb symbols`.
    pub symbol_status: String,
    pub symbol_path: String,
    /// The link timestamp, as the hex value the debugger printed.
    pub timestamp: Option<String>,
    /// The link timestamp as an RFC 3339 UTC date.
    pub time: Option<String>,
    pub image_path: Option<String>,
    pub image_name: Option<String>,
    pub file_version: Option<String>,
    pub product_version: Option<String>,
    pub description: Option<String>,
}

impl ModuleRecord {
    /// The start address without leading zeros.
    pub fn display_start(&self) -> &str {
        trim_zeros(&self.start_address)
    }

    /// The end address without leading zeros.
    pub fn display_end(&self) -> &str {
        trim_zeros(&self.end_address)
    }

    /// The version to show for the module.
    pub fn version(&self) -> Option<&str> {
        self.file_version
            .as_deref()
            .or(self.product_version.as_deref())
    }
}

fn trim_zeros(address: &str) -> &str {
    let trimmed = address.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

// Module names containing these are API set stubs and framework native
// images; they are never listed.
const EXCLUDED_MODULES: &[&str] = &[" System_", " api_ms_win"];

/// Extract the loaded modules, in the order the debugger listed them.
///
/// A module header row starts a module; the detail lines that follow it
/// fill in the rest of the record until the next header.
pub fn parse_modules(lines: &[String]) -> Vec<ModuleRecord> {
    let mut modules = Vec::new();
    let mut current: Option<ModuleRecord> = None;
    for line in lines {
        if let Ok((_, module)) = module_header(line) {
            modules.extend(current.take());
            if EXCLUDED_MODULES.iter().any(|name| line.contains(name)) {
                trace!("skipping module {}", module.name);
            } else {
                current = Some(module);
            }
            continue;
        }
        let Some(module) = current.as_mut() else {
            continue;
        };
        if let Some(path) = value_after(line, "Image path:") {
            module.image_path = Some(path.to_owned());
        } else if let Some(name) = value_after(line, "Image name:") {
            module.image_name = Some(name.to_owned());
        } else if line.contains("Timestamp:") {
            // Reproducible builds store a hash where the timestamp goes.
            if !line.contains("This is a reproducible build file hash, not a timestamp") {
                if let Some(timestamp) = parenthesized(line) {
                    module.time = format_timestamp(timestamp);
                    module.timestamp = Some(timestamp.to_owned());
                }
            }
        } else if let Some(version) = value_after(line, "File version:") {
            module.file_version = Some(version.to_owned());
        } else if let Some(version) = value_after(line, "ProductVersion:") {
            module.product_version = Some(version.to_owned());
        } else if let Some(description) = value_after(line, "FileDescription:") {
            module.description = Some(description.to_owned());
        }
    }
    modules.extend(current);
    modules
}

// `    Timestamp:        Thu Mar 14 09:30:19 2019 (5C8A1F2B)` -> `5C8A1F2B`
fn parenthesized(line: &str) -> Option<&str> {
    let open = line.rfind('(')?;
    let inner = &line[open + 1..];
    let value = inner[..inner.find(')')?].trim();
    (!value.is_empty()).then_some(value)
}

// `00007ff6`4e1c0000 00007ff6`4e1c8000   ConsoleApp C (private pdb symbols)  C:\src\ConsoleApp.pdb`
fn module_header(input: &str) -> IResult<&str, ModuleRecord> {
    let (path, (start, _, end, _, name, _, status)) = tuple((
        register_token,
        char(' '),
        register_token,
        space1,
        verify(word, |name: &str| name.len() >= 2),
        verify(take_until("("), |gap: &str| !gap.is_empty()),
        delimited(
            char('('),
            verify(take_till(|c: char| c == ')'), |status: &str| {
                status
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',' || c.is_whitespace())
            }),
            char(')'),
        ),
    ))(input)?;
    Ok((
        "",
        ModuleRecord {
            start_address: strip_backticks(start),
            end_address: strip_backticks(end),
            name: name.to_owned(),
            symbol_status: status.trim().to_owned(),
            symbol_path: path.trim().to_owned(),
            ..ModuleRecord::default()
        },
    ))
}
