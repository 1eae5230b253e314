// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Identity of the dumped process and the machine it ran on.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::parsers::{value_after, word};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    pub computer_name: Option<String>,
    pub user_name: Option<String>,
    /// The process id as `0x`-prefixed hex.
    pub process_id: Option<String>,
    pub command_line: Option<String>,
    pub os_info: Option<String>,
    pub environment: BTreeMap<String, String>,
}

/// Extract the target information.
///
/// Lines are scanned in order. `TARGET:` is followed by the operating system
/// line, and the session details after it (up to `Debug session time`) are
/// skipped. The process environment block comes last: once `PEB at` is seen
/// the rest of the section is read as its contents.
pub fn parse_target_info(lines: &[String]) -> TargetInfo {
    let mut info = TargetInfo::default();
    let mut idx = 0;
    while idx < lines.len() {
        let line = &lines[idx];
        idx += 1;
        if line.contains("TARGET:") {
            if let Some(os) = lines.get(idx) {
                info.os_info = Some(os_description(os));
                idx += 1;
                if let Some(offset) = lines[idx..]
                    .iter()
                    .position(|line| line.contains("Debug session time"))
                {
                    idx += offset + 1;
                }
            }
        } else if let Some(name) = value_after(line, "COMPUTERNAME =") {
            info.computer_name = Some(name.to_owned());
        } else if let Some(name) = value_after(line, "USERNAME =") {
            info.user_name = Some(name.to_owned());
        } else if line.contains("PROCESS_ID:") {
            if let Some(id) = lines.get(idx).and_then(|line| process_id(line)) {
                info.process_id = Some(format!("0x{id}"));
                idx += 1;
            }
        } else if line.contains("PEB at") {
            parse_peb(&lines[idx..], &mut info);
            break;
        }
    }
    info
}

fn os_description(line: &str) -> String {
    let os = line.split("Free x").next().unwrap_or(line);
    os.trim().to_owned()
}

// `.  0	id: 3f44	examine	name: C:\app\ConsoleApp.exe` -> `3f44`
fn process_id(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("id:")?;
    let rest = rest.strip_prefix(char::is_whitespace)?;
    word(rest).ok().map(|(_, id)| id)
}

fn parse_peb(lines: &[String], info: &mut TargetInfo) {
    let mut in_environment = false;
    for line in lines {
        if in_environment {
            if line.contains("=C:=C:") || line.contains("=::") {
                continue;
            }
            if let Some((name, value)) = line.split_once('=') {
                let name = name.trim();
                if !name.is_empty() && !value.is_empty() {
                    trace!("environment variable {}", name);
                    info.environment.insert(name.to_owned(), value.to_owned());
                }
            }
        } else if let Some(command_line) = command_line(line) {
            info.command_line = Some(command_line.to_owned());
        } else if line.contains("Environment:") {
            in_environment = true;
        }
    }
}

// `CommandLine:  '"C:\app\ConsoleApp.exe" --run'`
fn command_line(line: &str) -> Option<&str> {
    let rest = value_after(line, "CommandLine:")?;
    let rest = rest.strip_prefix('\'')?;
    let close = rest.rfind('\'')?;
    let command_line = &rest[..close];
    (!command_line.is_empty()).then_some(command_line)
}
