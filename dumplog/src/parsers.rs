// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

// Column-level combinators shared by the section extractors.

use std::str::FromStr;

use nom::bytes::complete::take_while1;
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, verify};
use nom::IResult;

use crate::utils::strip_backticks;

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// Match a run of word characters (`[A-Za-z0-9_]+`).
pub(crate) fn word(input: &str) -> IResult<&str, &str> {
    take_while1(is_word_char)(input)
}

// Match a word of a bounded length.
pub(crate) fn word_of_len<'a>(
    min: usize,
    max: usize,
) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    verify(word, move |w: &str| (min..=max).contains(&w.len()))
}

// Match a decimal string, parse it to a usize.
pub(crate) fn decimal_usize(input: &str) -> IResult<&str, usize> {
    map_res(digit1, usize::from_str)(input)
}

// Match an address column: hex digits, possibly split by a backtick.
// The backtick is removed from the result.
pub(crate) fn address(input: &str) -> IResult<&str, String> {
    map(
        verify(
            take_while1(|c: char| c.is_ascii_hexdigit() || c == '`'),
            |s: &str| s.starts_with(|c: char| c.is_ascii_hexdigit()),
        ),
        strip_backticks,
    )(input)
}

// Match a token of the characters the debugger uses in register dumps and
// module start/end columns (`[\w,`]+`).
pub(crate) fn register_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| is_word_char(c) || c == ',' || c == '`')(input)
}

/// The text following `key`, trimmed, if `line` has `key` and then
/// at least one whitespace character and some text.
pub(crate) fn value_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (_, rest) = line.split_once(key)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let value = rest.trim();
    (!value.is_empty()).then_some(value)
}
