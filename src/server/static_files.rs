//! Handlers for static file service

use super::error_pages;
use super::handler::Exchange;
use super::router::Route;

use mime::Mime;

use std::fs;
use std::path::Path;

/// Serves the file `route` resolved to, a directory listing, or an error
pub fn serve(route: &Route, ex: &mut Exchange) {
    let scope = &route.scope;

    let file = match route.script {
        Some(ref file) if route.path_info.is_empty() => file,
        Some(_) => {
            error_pages::apply(ex.response, 404, Some(scope));
            return;
        },
        None if route.is_dir => {
            if scope.boolean("autoindex") == Some(true) {
                autoindex(route, ex);
            }
            else {
                debug!("{}: {} is a directory without an index", ex.peer, route.url_path);
                error_pages::apply(ex.response, 403, Some(scope));
            }
            return;
        },
        None => {
            error_pages::apply(ex.response, 404, Some(scope));
            return;
        }
    };

    let body = match fs::read(file) {
        Ok(body) => body,
        Err(e) => {
            warn!("{}: cannot read {}: {}", ex.peer, file.display(), e);
            error_pages::apply(ex.response, error_pages::status_for(&e), Some(scope));
            return;
        }
    };

    ex.response.set_header("Content-Type", &content_type(file));
    ex.response.set_body(body);
    ex.response.set_complete();
}

/// Guesses a content type from the file extension
pub fn content_type(path: &Path) -> String {
    mime_guess::from_path(path).first()
        .map(mime_as_string)
        .unwrap_or_else(|| String::from("application/octet-stream"))
}

/// Translates a strongly-typed Mime type into a string
pub fn mime_as_string(mime: Mime) -> String {
    let mut s = String::new();

    s.push_str(mime.type_().as_str());
    s.push('/');
    s.push_str(mime.subtype().as_str());

    s
}

fn autoindex(route: &Route, ex: &mut Exchange) {
    let entries = match fs::read_dir(&route.fs_path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("{}: cannot list {}: {}", ex.peer, route.fs_path.display(), e);
            error_pages::apply(ex.response, error_pages::status_for(&e), Some(&route.scope));
            return;
        }
    };

    let mut listing: Vec<(String, bool, u64)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((entry.file_name().to_string_lossy().into_owned(), meta.is_dir(), meta.len()))
        })
        .collect();
    listing.sort();

    let base = format!("{}/", route.url_path.trim_end_matches('/'));
    let mut html = format!("<html><head><title>Index of {0}</title></head><body>\
                            <h1>Index of {0}</h1><hr><pre>\n", escape_html(&base));
    if base != "/" {
        html.push_str("<a href=\"../\">../</a>\n");
    }
    for (name, is_dir, size) in listing {
        let name = escape_html(&name);
        if is_dir {
            html.push_str(&format!("<a href=\"{0}/\">{0}/</a>\n", name));
        }
        else {
            html.push_str(&format!("<a href=\"{0}\">{0}</a> {1}\n", name, size));
        }
    }
    html.push_str("</pre><hr></body></html>");

    ex.response.set_header("Content-Type", "text/html");
    ex.response.set_body(html.into_bytes());
    ex.response.set_complete();
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c)
        }
    }
    escaped
}

#[test]
fn mime_as_string_html() {
    assert_eq!(mime_as_string(mime::TEXT_HTML), "text/html");
}

#[test]
fn mime_as_string_drops_parameters() {
    assert_eq!(mime_as_string(mime::TEXT_HTML_UTF_8), "text/html");
}

#[test]
fn content_type_defaults_to_octet_stream() {
    assert_eq!(content_type(Path::new("a.css")), "text/css");
    assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
}

#[test]
fn escapes_markup() {
    assert_eq!(escape_html("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
}
