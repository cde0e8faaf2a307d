//! Parsers for CGI/1.1 response headers

use super::{Header, Status};

use nom::bytes::complete::{tag, take_till1, take_while, take_while_m_n};
use nom::character::complete::space0;
use nom::combinator::{map, map_res, rest};
use nom::sequence::tuple;
use nom::IResult;

use std::str::{self, FromStr};

/// Terminators that may end a CGI header block, with their lengths
const TERMINATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];

/// Finds where the header block ends.
///
/// Returns the offset of the earliest terminator and the terminator's
/// length. Scripts are not consistent about line endings, so bare `\n\n`
/// and `\r\r` are accepted next to `\r\n\r\n`.
pub fn find_header_end(buffer: &[u8]) -> Option<(usize, usize)> {
    TERMINATORS.iter()
        .filter_map(|t| {
            buffer.windows(t.len())
                .position(|w| w == *t)
                .map(|at| (at, t.len()))
        })
        .min_by_key(|&(at, _)| at)
}

/// Splits a header block into its non-empty lines
pub fn header_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == b'\n' || b == b'\r')
        .filter(|line| !line.is_empty())
}

/// One `Name: value` line, without its terminator
pub fn header(input: &[u8]) -> IResult<&[u8], Header> {
    map(
        tuple((take_till1(is_colon), tag(":"), take_while(lwsp), rest)),
        |(name, _, _, content)| Header {
            name: String::from_utf8_lossy(trim_end(name)).into_owned(),
            content: String::from_utf8_lossy(trim_end(content)).into_owned()
        }
    )(input)
}

/// The value of a `Status` header: a three digit code and a reason phrase
pub fn status(input: &[u8]) -> IResult<&[u8], Status> {
    map(
        tuple((code, space0, rest)),
        |(code, _, phrase)| Status {
            code,
            reason_phrase: String::from_utf8_lossy(trim_end(phrase)).into_owned()
        }
    )(input)
}

fn code(input: &[u8]) -> IResult<&[u8], u16> {
    map_res(
        map_res(take_while_m_n(3, 3, |b: u8| b.is_ascii_digit()), str::from_utf8),
        u16::from_str
    )(input)
}

fn lwsp(x: u8) -> bool {
    x == b' ' || x == b'\t'
}

fn is_colon(x: u8) -> bool {
    x == b':'
}

fn trim_end(mut s: &[u8]) -> &[u8] {
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}
