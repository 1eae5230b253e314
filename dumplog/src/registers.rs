// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Instruction pointers, one per thread.

use tracing::trace;

use crate::parsers::register_token;
use crate::utils::strip_backticks;

/// Extract the instruction pointer of each thread, in the order the
/// threads were printed.
///
/// The debugger evaluates the register once per thread and prints
/// `Evaluate expression: 140718424223700 = 00007ffb`1f6a4fd4`. Lines with
/// no value, or with more than one, are skipped.
pub fn parse_instruction_pointers(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let pointer = evaluated_value(line);
            if pointer.is_none() {
                trace!("no instruction pointer in: {}", line);
            }
            pointer
        })
        .collect()
}

fn evaluated_value(line: &str) -> Option<String> {
    let mut values = line.match_indices('=').filter_map(|(idx, _)| {
        let rest = line[idx + 1..].strip_prefix(char::is_whitespace)?;
        register_token(rest).ok().map(|(_, value)| value)
    });
    let value = values.next()?;
    if values.next().is_some() {
        return None;
    }
    Some(strip_backticks(value))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_instruction_pointers() {
        let lines: Vec<String> = [
            "Evaluate expression: 140718424223700 = 00007ffb`1f6a4fd4",
            "0:000> r @rip",
            "Evaluate expression: 140718424223712 = 00007ffb`1f6a4fe0",
            "a = 1, b = 2",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            parse_instruction_pointers(&lines),
            vec!["00007ffb1f6a4fd4", "00007ffb1f6a4fe0"]
        );
    }
}
