//! Configured redirects

use super::error_pages;
use super::handler::Exchange;
use super::router::Route;
use super::static_files::escape_html;
use crate::http::reason_phrase;

/// Used when the configured code is not a redirection
const FALLBACK_STATUS: u16 = 302;

pub fn handle(route: &Route, ex: &mut Exchange) {
    let (code, target) = match route.scope.pair("redirect") {
        Some(redirect) => redirect,
        None => {
            error_pages::apply(ex.response, 500, Some(&route.scope));
            return;
        }
    };

    let status = match u16::try_from(code) {
        Ok(status) if (300 .. 400).contains(&status) => status,
        _ => {
            warn!("Redirect code {} is not a 3xx; sending {}", code, FALLBACK_STATUS);
            FALLBACK_STATUS
        }
    };

    let link = escape_html(&target);
    let body = format!("<html><head><title>{0} {1}</title></head><body><h1>{1}</h1>\
                        <p>This resource has moved to <a href=\"{2}\">{2}</a>.</p></body></html>",
                       status, reason_phrase(status), link);

    debug!("{}: redirecting {} to {}", ex.peer, route.url_path, target);
    ex.response.set_status(status);
    ex.response.set_header("Location", &target);
    ex.response.set_header("Content-Type", "text/html");
    ex.response.set_header("Cache-Control", "no-cache");
    ex.response.set_body(body.into_bytes());
    ex.response.set_complete();
}
