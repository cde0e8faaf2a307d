//! Helpers for filesystem manipulations

use crate::errors::{Result, Error};

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Normalizes a request path.
///
/// The following operations are performed:
///
/// 1. Sequences of multiple `'/'` characters are collapsed into a single `'/'`.
/// 2. Any leading `'/'` is stripped. (If the request path doesn’t lead with a
///    slash, the path is ill-formed for our purposes and we return an `Err`).
/// 3. Percent-encoded bytes are decoded. Bogus percent-encoding, like `b"%bo"`,
///    will return `Err`.
/// 4. `.` segments are dropped and `..` segments remove their parent. A `..`
///    that would climb above the root returns `Err`.
///
/// A trailing slash is dropped, so `b"/dir/"` normalizes to `b"dir"`.
pub fn normalize_path(path: &[u8]) -> Result<Vec<u8>> {
    if path.first() != Some(&b'/') {
        return Err(Error::PathNotInOriginForm);
    }

    let mut segments: Vec<Vec<u8>> = Vec::new();

    for raw in path[1 ..].split(|&b| b == b'/') {
        if raw.is_empty() {
            continue;
        }

        let segment = percent_decode(raw)?;
        if segment.iter().any(|&b| b == b'/' || b == 0) {
            return Err(Error::PathTraversal);
        }

        match &segment[..] {
            b"." => (),
            b".." => {
                if segments.pop().is_none() {
                    return Err(Error::PathTraversal);
                }
            },
            _ => segments.push(segment)
        }
    }

    Ok(segments.join(&b'/'))
}

/// Decodes `%XX` escapes in a single path segment
fn percent_decode(segment: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(segment.len());
    let mut i = 0;

    while i < segment.len() {
        match segment[i] {
            b'%' => {
                if i + 2 >= segment.len() {
                    return Err(Error::IllegalPercentEncoding);
                }

                let high_nybble = segment[i + 1];
                let low_nybble = segment[i + 2];

                if !is_hexit(high_nybble) || !is_hexit(low_nybble) {
                    return Err(Error::IllegalPercentEncoding);
                }

                buffer.push(from_hexit(high_nybble) << 4 |
                            from_hexit(low_nybble));

                i += 3;
            },
            b => {
                buffer.push(b);
                i += 1;
            }
        }
    }

    Ok(buffer)
}

/// `true` if the file has any execute bit set
pub fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false
    }
}

/// The extension of the final path component, without its dot
pub fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Reduces a client-supplied file name to a safe single component.
///
/// Directory parts are dropped, bytes outside `[A-Za-z0-9._-]` become `_`,
/// and leading dots are removed. An empty result becomes `"upload"`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");

    let cleaned: String = base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            c
        }
        else {
            '_'
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        String::from("upload")
    }
    else {
        cleaned.to_string()
    }
}


/// Returns `true` iff the byte is a hexadecimal digit according to ASCII
fn is_hexit(x: u8) -> bool {
    x.is_ascii_hexdigit()
}

/// Converts from a hexadecimal digit to its value
fn from_hexit(x: u8) -> u8 {
    match x {
        b'0' ..= b'9' => x - b'0',
        b'A' ..= b'F' => x - b'A' + 10,
        b'a' ..= b'f' => x - b'a' + 10,
        _ => panic!("Contract violation: from_hexit expected a hexit, got 0x{:X}", x)
    }
}

#[test]
fn from_hexit_works() {
    for x in 0x0 .. 0x10 {
        assert_eq!(from_hexit(std::char::from_digit(x, 16).unwrap() as u8), x as u8);
    }
}
