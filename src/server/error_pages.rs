//! Error responses

use crate::config::Scope;
use crate::http::{reason_phrase, HttpResponse, SERVER_SOFTWARE};

use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

/// Replaces whatever `response` holds with the error page for `status`,
/// leaving it open for further headers
pub fn fill(response: &mut HttpResponse, status: u16, scope: Option<&Scope>) {
    response.reset();
    response.set_status(status);
    response.set_header("Content-Type", "text/html");
    response.set_body(page(status, scope));
}

/// Like `fill`, and seals the response
pub fn apply(response: &mut HttpResponse, status: u16, scope: Option<&Scope>) {
    if response.is_complete() {
        warn!("Not replacing a completed {} response with a {} page",
              response.status(), status);
        return;
    }

    fill(response, status, scope);
    response.set_complete();
}

/// The status a failed filesystem operation turns into
pub fn status_for(error: &io::Error) -> u16 {
    match error.kind() {
        ErrorKind::NotFound => 404,
        ErrorKind::PermissionDenied => 403,
        _ => match error.raw_os_error() {
            Some(libc::ENOTDIR) | Some(libc::ENAMETOOLONG) => 404,
            Some(libc::ENOTEMPTY) | Some(libc::EEXIST) | Some(libc::EROFS) => 403,
            _ => 500
        }
    }
}

fn page(status: u16, scope: Option<&Scope>) -> Vec<u8> {
    scope.and_then(|scope| custom_page(scope, status))
        .unwrap_or_else(|| default_page(status).into_bytes())
}

/// Reads the configured page for `status`.
///
/// Paths are taken as absolute first, then relative to the scope's root.
fn custom_page(scope: &Scope, status: u16) -> Option<Vec<u8>> {
    let configured = scope.error_page(status)?;

    let mut candidates: Vec<PathBuf> = Vec::with_capacity(2);
    if configured.is_absolute() {
        candidates.push(configured.clone());
    }
    if let Some(root) = scope.root() {
        candidates.push(root.join(configured.strip_prefix("/").unwrap_or(&configured)));
    }

    for candidate in &candidates {
        if let Ok(body) = fs::read(candidate) {
            return Some(body);
        }
    }

    warn!("Error page {} for {} is unreadable; using the default",
          configured.display(), status);
    None
}

pub fn default_page(status: u16) -> String {
    let title = format!("{} {}", status, reason_phrase(status));
    format!("<html><head><title>{0}</title></head><body><h1>{0}</h1><hr><p>{1}</p></body></html>",
            title, SERVER_SOFTWARE)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::parser::parse_str;

    #[test]
    fn default_pages_name_the_status() {
        let page = default_page(404);
        assert!(page.contains("<title>404 Not Found</title>"));
        assert!(page.contains(SERVER_SOFTWARE));
    }

    #[test]
    fn custom_pages_resolve_against_the_root() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("errors")).unwrap();
        fs::write(root.path().join("errors/404.html"), "gone fishing").unwrap();

        let config = parse_str(&format!(r#"
            [[server]]
            listen = 0
            root = {:?}
            error_page = {{ 404 = "/errors/404.html", 500 = "/errors/missing.html" }}
        "#, root.path().to_str().unwrap())).unwrap();
        let scope = config.servers[0].scope();

        let mut response = HttpResponse::new();
        apply(&mut response, 404, Some(scope));
        assert_eq!(response.body(), b"gone fishing");
        assert_eq!(response.headers().get("content-type"), Some("text/html"));

        let mut response = HttpResponse::new();
        apply(&mut response, 500, Some(scope));
        assert!(response.body().starts_with(b"<html>"));
    }

    #[test]
    fn completed_responses_are_left_alone() {
        let mut response = HttpResponse::new();
        response.set_body(b"done".to_vec());
        response.set_complete();

        apply(&mut response, 500, None);
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"done");
    }

    #[test]
    fn io_errors_map_to_statuses() {
        assert_eq!(status_for(&io::Error::from(ErrorKind::NotFound)), 404);
        assert_eq!(status_for(&io::Error::from(ErrorKind::PermissionDenied)), 403);
        assert_eq!(status_for(&io::Error::from_raw_os_error(libc::ENOTEMPTY)), 403);
        assert_eq!(status_for(&io::Error::from_raw_os_error(libc::EIO)), 500);
    }
}
