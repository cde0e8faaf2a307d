//! Request routing
//!
//! A completed request is matched against the server chosen by its `Host`
//! header, then against that server's locations: the longest location prefix
//! that ends on a path boundary wins, `/` matches everything at the lowest
//! priority, and equally long prefixes go to the one declared first. The
//! matched scope then decides which handler answers.

use super::error_pages;
use super::handler::{Handler, Kind};
use crate::cgi::CgiHandler;
use crate::config::{Scope, ServerConfig};
use crate::errors::Error;
use crate::filesystem;
use crate::http::{HttpRequest, HttpResponse, KNOWN_METHODS, SUPPORTED_VERSIONS};

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::rc::Rc;

/// Where a request target leads
#[derive(Debug, Clone)]
pub struct Route {
    pub scope: Rc<Scope>,
    /// Prefix of the matched location; empty for the server scope
    pub location: String,
    /// Normalized, percent-decoded path, always starting with `/`
    pub url_path: String,
    /// The filesystem path the whole URL path maps to
    pub fs_path: PathBuf,
    /// The regular file the path resolved to, if any: either a file met
    /// while walking the path or a directory's index file
    pub script: Option<PathBuf>,
    /// URL path up to and including `script`
    pub script_url: String,
    /// What followed `script` in the URL path
    pub path_info: String,
    pub query: String,
    pub fragment: String,
    pub is_dir: bool
}

impl Route {
    /// The interpreter configured for the script's extension; an empty
    /// string means the script runs directly
    pub fn cgi_interpreter(&self) -> Option<&str> {
        self.script.as_deref()
            .and_then(filesystem::extension)
            .and_then(|ext| self.scope.cgi_interpreter(ext))
    }

    /// CGI is on for this scope and the script has a mapped extension
    pub fn is_cgi(&self) -> bool {
        self.scope.boolean("cgi_enabled") == Some(true) && self.cgi_interpreter().is_some()
    }
}

/// A request rejected before any handler ran
#[derive(Debug, thiserror::Error)]
#[error("{status} {message}")]
pub struct RouteError {
    pub status: u16,
    pub message: String,
    /// Scope whose error pages render the response
    pub scope: Option<Rc<Scope>>,
    /// Methods for the `Allow` header of a 405
    pub allow: Option<Vec<String>>
}

impl RouteError {
    pub fn new<S: Into<String>>(status: u16, message: S) -> RouteError {
        RouteError { status, message: message.into(), scope: None, allow: None }
    }

    fn in_scope(mut self, scope: &Rc<Scope>) -> RouteError {
        self.scope = Some(scope.clone());
        self
    }

    fn allowing(mut self, methods: Vec<String>) -> RouteError {
        self.allow = Some(methods);
        self
    }

    /// Turns the rejection into a complete error response
    pub fn respond(&self, response: &mut HttpResponse) {
        error_pages::fill(response, self.status, self.scope.as_deref());
        if let Some(ref methods) = self.allow {
            response.set_header("Allow", &methods.join(", "));
        }
        response.set_complete();
    }
}

/// Whether `path` lies under the location `prefix`
fn matches_location(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }

    path.starts_with(prefix) &&
        (path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/')
}

/// Picks the location for `path`, if any matches
fn match_location<'a>(server: &'a ServerConfig, path: &str) -> Option<&'a Rc<Scope>> {
    let mut best: Option<(usize, &Rc<Scope>)> = None;

    for scope in server.locations() {
        let prefix = match scope.location() {
            Some(prefix) => prefix,
            None => continue
        };
        if !matches_location(prefix, path) {
            continue;
        }

        let length = prefix.trim_end_matches('/').len();
        if best.map_or(true, |(longest, _)| length > longest) {
            best = Some((length, scope));
        }
    }

    best.map(|(_, scope)| scope)
}

/// Resolves `target` against `server`'s configuration and the filesystem
pub fn resolve(server: &ServerConfig, target: &str) -> Result<Route, RouteError> {
    let (target, fragment) = match target.split_once('#') {
        Some((target, fragment)) => (target, fragment),
        None => (target, "")
    };
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, "")
    };

    let normalized = match filesystem::normalize_path(path.as_bytes()) {
        Ok(normalized) => normalized,
        Err(Error::PathTraversal) => return Err(
            RouteError::new(403, "path climbs out of the document root")
                .in_scope(server.scope())
        ),
        Err(e) => return Err(RouteError::new(400, e.to_string()).in_scope(server.scope()))
    };
    let normalized = String::from_utf8(normalized).map_err(|_| {
        RouteError::new(400, "path is not UTF-8").in_scope(server.scope())
    })?;
    let url_path = format!("/{}", normalized);

    let (scope, location) = match match_location(server, &url_path) {
        Some(scope) => (scope.clone(), scope.location().unwrap_or("").to_string()),
        None => (server.scope().clone(), String::new())
    };

    let root = scope.root().ok_or_else(|| {
        RouteError::new(500, "no root configured").in_scope(&scope)
    })?;

    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

    // A location with a root of its own maps its prefix onto that root.
    let skip = if scope.declares("root") {
        location.split('/').filter(|s| !s.is_empty()).count()
    }
    else {
        0
    };
    let relative = &segments[skip.min(segments.len()) ..];

    let fs_path = relative.iter()
        .fold(root.clone(), |path, segment| path.join(OsStr::from_bytes(segment.as_bytes())));

    let mut route = Route {
        scope,
        location,
        url_path,
        fs_path,
        script: None,
        script_url: String::new(),
        path_info: String::new(),
        query: query.to_string(),
        fragment: fragment.to_string(),
        is_dir: false
    };

    let mut dir = root;
    for (i, segment) in relative.iter().enumerate() {
        let candidate = dir.join(segment);
        if candidate.is_file() {
            route.script = Some(candidate);
            route.script_url = format!("/{}", segments[.. skip + i + 1].join("/"));
            if i + 1 < relative.len() {
                route.path_info = format!("/{}", relative[i + 1 ..].join("/"));
            }
            break;
        }
        else if candidate.is_dir() {
            dir = candidate;
        }
        else {
            break;
        }
    }

    route.is_dir = route.script.is_none() && route.fs_path.is_dir();

    if route.is_dir {
        for index in route.scope.index_files() {
            let candidate = route.fs_path.join(&index);
            if candidate.is_file() {
                route.script_url = format!("{}/{}", route.url_path.trim_end_matches('/'), index);
                route.script = Some(candidate);
                break;
            }
        }
    }

    trace!("{} resolved to {:?}", target, route);
    Ok(route)
}

/// Chooses a server and a handler for every completed request
#[derive(Debug)]
pub struct Router {
    servers: Vec<Rc<ServerConfig>>
}

impl Router {
    pub fn new(servers: Vec<Rc<ServerConfig>>) -> Router {
        Router { servers }
    }

    /// The server named by `host`, otherwise the first one
    pub fn select_server(&self, host: Option<&str>) -> Option<&Rc<ServerConfig>> {
        host.and_then(|host| self.servers.iter().find(|s| s.answers_to(host)))
            .or_else(|| self.servers.first())
    }

    /// The scope that answers requests too broken to route
    pub fn default_scope(&self) -> Option<&Rc<Scope>> {
        self.servers.first().map(|server| server.scope())
    }

    /// The largest `client_max_body_size` of any scope this router
    /// serves. Bodies beyond it are refused while still being read.
    pub fn max_body_size(&self) -> usize {
        self.servers.iter()
            .flat_map(|server| std::iter::once(server.scope()).chain(server.locations()))
            .map(|scope| scope.max_body_size())
            .max()
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX))
    }

    /// Validates `request` and picks the handler that will answer it
    pub fn dispatch(&self, request: &HttpRequest) -> Result<Handler, RouteError> {
        let server = self.select_server(request.host())
            .ok_or_else(|| RouteError::new(500, "no server configured"))?;
        let method = request.method();

        if !SUPPORTED_VERSIONS.contains(&request.version()) {
            return Err(RouteError::new(505, format!("unsupported version {}", request.version()))
                       .in_scope(server.scope()));
        }
        if !KNOWN_METHODS.contains(&method) {
            return Err(RouteError::new(501, format!("unknown method {}", method))
                       .in_scope(server.scope()));
        }

        let route = resolve(server, request.target())?;
        let scope = &route.scope;

        let allowed = scope.allowed_methods();
        if !allowed.iter().any(|m| m == method) {
            return Err(RouteError::new(405, format!("{} not allowed here", method))
                       .in_scope(scope)
                       .allowing(allowed));
        }

        let limit = scope.max_body_size();
        if request.body().len() as u64 > limit {
            return Err(RouteError::new(413, format!("body of {} bytes exceeds {}",
                                                    request.body().len(), limit))
                       .in_scope(scope));
        }

        if let Some(length) = request.content_length() {
            if length != request.body().len() {
                return Err(RouteError::new(400, "Content-Length does not match the body")
                           .in_scope(scope));
            }
        }

        if request.version() == "HTTP/1.1" && request.host().map_or(true, str::is_empty) {
            return Err(RouteError::new(400, "HTTP/1.1 request without Host").in_scope(scope));
        }

        let kind = if route.is_cgi() {
            Kind::Cgi(CgiHandler::new())
        }
        else if method == "DELETE" {
            Kind::Delete
        }
        else if scope.pair("redirect").is_some() {
            Kind::Redirect
        }
        else if method == "POST" && scope.string("upload_store").is_some() {
            Kind::Upload
        }
        else {
            Kind::Static
        };

        debug!("{} {} goes to the {} handler (location {:?})",
               method, request.target(), kind.name(), route.location);
        Ok(Handler::new(kind, route))
    }
}
