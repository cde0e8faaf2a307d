//! `multipart/form-data` uploads
//!
//! Every part carrying a filename is written into the scope's `upload_store`
//! under a sanitized name that does not clobber an existing file. The
//! response is a JSON manifest of what was stored where.

use super::error_pages;
use super::handler::Exchange;
use super::router::Route;
use crate::filesystem;

use mime::Mime;
use serde::Serialize;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Headers allowed on a single part
const MAX_PART_HEADERS: usize = 16;
/// Suffixed names tried before giving up on a collision
const MAX_NAME_ATTEMPTS: u32 = 64;

#[derive(Debug, Serialize)]
struct StoredFile {
    field: String,
    filename: String,
    stored_as: String,
    content_type: String,
    size: usize
}

#[derive(Debug, Serialize)]
struct Manifest {
    files: Vec<StoredFile>
}

#[derive(Debug)]
struct Part<'a> {
    name: String,
    filename: Option<String>,
    content_type: String,
    data: &'a [u8]
}

pub fn handle(route: &Route, ex: &mut Exchange) {
    let scope = &route.scope;

    let store = match store_dir(route) {
        Some(store) => store,
        None => {
            error!("{}: upload_store is set but cannot be placed", ex.peer);
            error_pages::apply(ex.response, 500, Some(scope));
            return;
        }
    };

    let content_type = ex.request.headers().get("Content-Type").unwrap_or("");
    let mime: Mime = match content_type.parse() {
        Ok(mime) => mime,
        Err(_) => {
            error_pages::apply(ex.response, 415, Some(scope));
            return;
        }
    };
    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        debug!("{}: upload with content type {}", ex.peer, content_type);
        error_pages::apply(ex.response, 415, Some(scope));
        return;
    }

    let boundary = match mime.get_param(mime::BOUNDARY) {
        Some(boundary) => boundary.as_str().to_string(),
        None => {
            error_pages::apply(ex.response, 400, Some(scope));
            return;
        }
    };

    let parts = match parse_multipart(ex.request.body(), &boundary) {
        Ok(parts) => parts,
        Err(reason) => {
            warn!("{}: malformed multipart body: {}", ex.peer, reason);
            error_pages::apply(ex.response, 400, Some(scope));
            return;
        }
    };

    if let Err(e) = fs::create_dir_all(&store) {
        error!("{}: cannot create {}: {}", ex.peer, store.display(), e);
        error_pages::apply(ex.response, error_pages::status_for(&e), Some(scope));
        return;
    }

    let mut files = Vec::new();
    for part in parts.iter().filter(|p| p.filename.is_some()) {
        match store_part(&store, part) {
            Ok(stored) => {
                info!("{}: stored upload {:?} as {}", ex.peer, stored.filename, stored.stored_as);
                files.push(stored);
            },
            Err(e) => {
                error!("{}: storing an upload in {} failed: {}", ex.peer, store.display(), e);
                error_pages::apply(ex.response, error_pages::status_for(&e), Some(scope));
                return;
            }
        }
    }

    if files.is_empty() {
        debug!("{}: multipart body without any file", ex.peer);
        error_pages::apply(ex.response, 400, Some(scope));
        return;
    }

    match serde_json::to_vec(&Manifest { files }) {
        Ok(body) => {
            ex.response.set_status(201);
            ex.response.set_header("Content-Type", "application/json");
            ex.response.set_body(body);
            ex.response.set_complete();
        },
        Err(e) => {
            error!("Serializing the upload manifest failed: {}", e);
            error_pages::apply(ex.response, 500, Some(scope));
        }
    }
}

/// `upload_store`, relative to the root unless absolute
fn store_dir(route: &Route) -> Option<PathBuf> {
    let store = PathBuf::from(route.scope.string("upload_store")?);
    if store.is_absolute() {
        Some(store)
    }
    else {
        route.scope.root().map(|root| root.join(store))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>, &'static str> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = format!("\r\n--{}", boundary).into_bytes();

    let start = find(body, &delimiter).ok_or("no opening boundary")?;
    let mut rest = &body[start + delimiter.len() ..];
    let mut parts = Vec::new();

    loop {
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        rest = rest.strip_prefix(b"\r\n")
            .or_else(|| rest.strip_prefix(b"\n"))
            .ok_or("boundary not followed by a line break")?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
        let (head_len, headers) = match httparse::parse_headers(rest, &mut headers) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            _ => return Err("malformed part headers")
        };

        let mut part = Part {
            name: String::new(),
            filename: None,
            content_type: String::from("application/octet-stream"),
            data: &[]
        };
        for header in headers {
            let value = String::from_utf8_lossy(header.value);
            if header.name.eq_ignore_ascii_case("Content-Disposition") {
                let (name, filename) = parse_disposition(&value);
                part.name = name.unwrap_or_default();
                part.filename = filename;
            }
            else if header.name.eq_ignore_ascii_case("Content-Type") {
                part.content_type = value.trim().to_string();
            }
        }

        let content = &rest[head_len ..];
        let end = find(content, &separator).ok_or("part is never closed")?;
        part.data = &content[.. end];
        parts.push(part);

        rest = &content[end + separator.len() ..];
    }
}

/// Pulls `name` and `filename` out of a `form-data` disposition
fn parse_disposition(value: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;

    for param in value.split(';').skip(1) {
        let (key, val) = match param.split_once('=') {
            Some(kv) => kv,
            None => continue
        };
        let val = val.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(val),
            "filename" => filename = Some(val),
            _ => ()
        }
    }

    (name, filename)
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[.. dot], &name[dot ..]),
        _ => (name, "")
    }
}

/// Writes `part` into `store` under a name no other file has
fn store_part(store: &Path, part: &Part) -> io::Result<StoredFile> {
    let original = part.filename.clone().unwrap_or_default();
    let clean = filesystem::sanitize_filename(&original);
    let (stem, extension) = split_extension(&clean);
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis());

    for attempt in 0 .. MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            clean.clone()
        }
        else {
            format!("{}_{}_{}{}", stem, stamp, attempt, extension)
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(store.join(&name)) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e)
        };
        file.write_all(part.data)?;

        return Ok(StoredFile {
            field: part.name.clone(),
            filename: original,
            stored_as: name,
            content_type: part.content_type.clone(),
            size: part.data.len()
        });
    }

    Err(io::Error::new(io::ErrorKind::AlreadyExists,
                       format!("no free name for {:?}", clean)))
}

#[cfg(test)]
mod test {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
        Content-Disposition: form-data; name=\"note\"\r\n\r\n\
        just a field\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"../../etc/report.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        line one\r\nline two\r\n\
        --XyZ--\r\n";

    #[test]
    fn parses_fields_and_files() {
        let parts = parse_multipart(BODY, "XyZ").unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name, "note");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].data, b"just a field");

        assert_eq!(parts[1].name, "file");
        assert_eq!(parts[1].filename.as_deref(), Some("../../etc/report.txt"));
        assert_eq!(parts[1].content_type, "text/plain");
        assert_eq!(parts[1].data, b"line one\r\nline two");
    }

    #[test]
    fn unterminated_bodies_are_rejected() {
        assert!(parse_multipart(b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nabc",
                                "XyZ").is_err());
        assert!(parse_multipart(b"no boundary here", "XyZ").is_err());
    }

    #[test]
    fn dispositions() {
        assert_eq!(parse_disposition("form-data; name=\"a\"; filename=\"b.txt\""),
                   (Some(String::from("a")), Some(String::from("b.txt"))));
        assert_eq!(parse_disposition("form-data; name=plain"),
                   (Some(String::from("plain")), None));
    }

    #[test]
    fn collisions_get_fresh_names() {
        let store = tempfile::tempdir().unwrap();
        let part = Part {
            name: String::from("file"),
            filename: Some(String::from("../../etc/report.txt")),
            content_type: String::from("text/plain"),
            data: b"data"
        };

        let first = store_part(store.path(), &part).unwrap();
        let second = store_part(store.path(), &part).unwrap();

        assert_eq!(first.stored_as, "report.txt");
        assert_ne!(second.stored_as, first.stored_as);
        assert!(second.stored_as.starts_with("report_"));
        assert!(second.stored_as.ends_with(".txt"));
        assert_eq!(fs::read(store.path().join(&second.stored_as)).unwrap(), b"data");
    }
}
