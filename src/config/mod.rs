//! The configuration tree
//!
//! Configuration is a three-level hierarchy: the global scope, one scope per
//! `[[server]]` block, and one scope per `[server.location."/prefix"]` block.
//! Every lookup falls back to the parent scope when the directive is absent,
//! so a location only needs to spell out what differs from its server.
//!
//! The tree is built once at startup and never mutated; scopes are shared by
//! `Rc` between the router and every in-flight request.

pub mod parser;

use toml::{Table, Value};

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// Default request body cap, 1 MiB
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;
/// Default idle and CGI deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Methods permitted when a scope does not say otherwise
pub const DEFAULT_ALLOWED_METHODS: [&str; 6] =
    ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS"];

/// A holder for app configuration
#[derive(Debug)]
pub struct Config {
    pub global: Rc<Scope>,
    pub servers: Vec<Rc<ServerConfig>>
}

/// One `[[server]]` block
#[derive(Debug)]
pub struct ServerConfig {
    scope: Rc<Scope>,
    locations: Vec<Rc<Scope>>,
    address: SocketAddr,
    names: Vec<String>
}

impl ServerConfig {
    pub fn new(scope: Rc<Scope>, locations: Vec<Rc<Scope>>,
               host: IpAddr, port: u16, names: Vec<String>) -> ServerConfig
    {
        ServerConfig {
            scope,
            locations,
            address: SocketAddr::new(host, port),
            names
        }
    }

    /// The server-level scope, parent of every location
    pub fn scope(&self) -> &Rc<Scope> {
        &self.scope
    }

    /// Location scopes in declaration order
    pub fn locations(&self) -> &[Rc<Scope>] {
        &self.locations
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.address
    }

    /// Whether `host` (a `Host` header without its port) names this server
    pub fn answers_to(&self, host: &str) -> bool {
        self.names.iter().any(|name| name.eq_ignore_ascii_case(host))
    }
}

/// Which block a scope was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Server,
    /// A location with its URI prefix
    Location(String)
}

/// A set of directives with a fallback parent
#[derive(Debug)]
pub struct Scope {
    kind: ScopeKind,
    directives: Table,
    parent: Option<Rc<Scope>>
}

impl Scope {
    pub fn new(kind: ScopeKind, directives: Table, parent: Option<Rc<Scope>>)
               -> Scope
    {
        Scope { kind, directives, parent }
    }

    /// The location prefix, if this is a location scope
    pub fn location(&self) -> Option<&str> {
        match self.kind {
            ScopeKind::Location(ref prefix) => Some(prefix),
            _ => None
        }
    }

    /// Whether this scope itself, not an ancestor, sets `name`
    pub fn declares(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        match self.directives.get(name) {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|p| p.lookup(name))
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.lookup(name).and_then(Value::as_str)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.lookup(name).and_then(Value::as_bool)
    }

    /// A byte count, given either as an integer or a string like `"10M"`
    pub fn size(&self, name: &str) -> Option<u64> {
        self.lookup(name).and_then(size_of_value)
    }

    /// A list of strings; a lone string counts as a one-element list
    pub fn list(&self, name: &str) -> Option<Vec<String>> {
        self.lookup(name).and_then(list_of_value)
    }

    /// A `[code, "text"]` pair
    pub fn pair(&self, name: &str) -> Option<(i64, String)> {
        self.lookup(name).and_then(pair_of_value)
    }

    /// A duration in seconds, integer or float
    pub fn duration(&self, name: &str) -> Option<Duration> {
        self.lookup(name).and_then(duration_of_value)
    }

    /// The custom error page for `code`.
    ///
    /// Codes fall back individually, so a location that overrides the 404
    /// page still inherits its server's 500 page.
    pub fn error_page(&self, code: u16) -> Option<PathBuf> {
        let own = self.directives.get("error_page")
            .and_then(Value::as_table)
            .and_then(|pages| pages.get(&code.to_string()))
            .and_then(Value::as_str)
            .map(PathBuf::from);

        match own {
            Some(page) => Some(page),
            None => self.parent.as_ref().and_then(|p| p.error_page(code))
        }
    }

    /// The interpreter for scripts ending in `.ext`.
    ///
    /// An empty string means the script is executed directly. Extensions
    /// fall back individually, like `error_page`.
    pub fn cgi_interpreter(&self, ext: &str) -> Option<&str> {
        let own = self.directives.get("cgi_ext")
            .and_then(Value::as_table)
            .and_then(|map| map.get(ext).or_else(|| map.get(&format!(".{}", ext))))
            .and_then(Value::as_str);

        match own {
            Some(interpreter) => Some(interpreter),
            None => self.parent.as_ref().and_then(|p| p.cgi_interpreter(ext))
        }
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.string("root").map(PathBuf::from)
    }

    pub fn max_body_size(&self) -> u64 {
        self.size("client_max_body_size").unwrap_or(DEFAULT_MAX_BODY_SIZE)
    }

    pub fn timeout(&self) -> Duration {
        self.duration("timeout").unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn cgi_timeout(&self) -> Duration {
        self.duration("cgi_timeout").unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn allowed_methods(&self) -> Vec<String> {
        self.list("allowed_methods").unwrap_or_else(|| {
            DEFAULT_ALLOWED_METHODS.iter().map(|m| m.to_string()).collect()
        })
    }

    pub fn index_files(&self) -> Vec<String> {
        self.list("index").unwrap_or_default()
    }
}

fn size_of_value(value: &Value) -> Option<u64> {
    match *value {
        Value::Integer(n) if n >= 0 => Some(n as u64),
        Value::String(ref s) => parse_size(s),
        _ => None
    }
}

/// Parses `"512"`, `"64K"`, `"10M"` or `"1G"` into bytes
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((i, 'k')) | Some((i, 'K')) => (&text[.. i], 1024),
        Some((i, 'm')) | Some((i, 'M')) => (&text[.. i], 1024 * 1024),
        Some((i, 'g')) | Some((i, 'G')) => (&text[.. i], 1024 * 1024 * 1024),
        Some(_) => (text, 1),
        None => return None
    };

    digits.trim().parse::<u64>().ok()
        .and_then(|n| n.checked_mul(multiplier))
}

fn list_of_value(value: &Value) -> Option<Vec<String>> {
    match *value {
        Value::String(ref s) => Some(vec![s.clone()]),
        Value::Array(ref items) => items.iter()
            .map(|item| item.as_str().map(String::from))
            .collect(),
        _ => None
    }
}

fn pair_of_value(value: &Value) -> Option<(i64, String)> {
    let items = value.as_array()?;
    match &items[..] {
        [Value::Integer(code), Value::String(text)] => Some((*code, text.clone())),
        _ => None
    }
}

fn duration_of_value(value: &Value) -> Option<Duration> {
    match *value {
        Value::Integer(n) if n >= 0 => Some(Duration::from_secs(n as u64)),
        Value::Float(f) => Duration::try_from_secs_f64(f).ok(),
        _ => None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(toml: &str) -> Table {
        toml.parse::<Table>().unwrap()
    }

    fn chain() -> (Rc<Scope>, Scope) {
        let global = Rc::new(Scope::new(ScopeKind::Global, table(r#"
            client_max_body_size = "2M"
            timeout = 5
            error_page = { 404 = "/404.html", 500 = "/500.html" }
            cgi_ext = { py = "/usr/bin/python3" }
        "#), None));

        let server = Rc::new(Scope::new(ScopeKind::Server, table(r#"
            root = "/srv/www"
            index = ["index.html", "index.htm"]
        "#), Some(global)));

        let location = Scope::new(ScopeKind::Location(String::from("/cgi-bin")),
                                  table(r#"
            cgi_enabled = true
            cgi_timeout = 1.5
            error_page = { 404 = "/cgi404.html" }
            cgi_ext = { ".sh" = "" }
            redirect = [301, "https://example.com/"]
            allowed_methods = "GET"
        "#), Some(server.clone()));

        (server, location)
    }

    #[test]
    fn lookups_fall_back_to_parents() {
        let (_, location) = chain();

        assert_eq!(location.string("root"), Some("/srv/www"));
        assert_eq!(location.max_body_size(), 2 * 1024 * 1024);
        assert_eq!(location.timeout(), Duration::from_secs(5));
        assert_eq!(location.cgi_timeout(), Duration::from_millis(1500));
        assert_eq!(location.boolean("cgi_enabled"), Some(true));
        assert_eq!(location.index_files(), vec!["index.html", "index.htm"]);
        assert_eq!(location.location(), Some("/cgi-bin"));
    }

    #[test]
    fn missing_directives_use_defaults() {
        let (server, _) = chain();

        assert_eq!(server.boolean("cgi_enabled"), None);
        assert_eq!(server.cgi_timeout(), DEFAULT_TIMEOUT);
        assert_eq!(server.allowed_methods().len(), DEFAULT_ALLOWED_METHODS.len());
        assert_eq!(server.pair("redirect"), None);
    }

    #[test]
    fn typed_values() {
        let (_, location) = chain();

        assert_eq!(location.pair("redirect"),
                   Some((301, String::from("https://example.com/"))));
        assert_eq!(location.allowed_methods(), vec!["GET"]);
    }

    #[test]
    fn error_pages_fall_back_per_code() {
        let (_, location) = chain();

        assert_eq!(location.error_page(404), Some(PathBuf::from("/cgi404.html")));
        assert_eq!(location.error_page(500), Some(PathBuf::from("/500.html")));
        assert_eq!(location.error_page(403), None);
    }

    #[test]
    fn cgi_extensions_fall_back_per_extension() {
        let (_, location) = chain();

        assert_eq!(location.cgi_interpreter("sh"), Some(""));
        assert_eq!(location.cgi_interpreter("py"), Some("/usr/bin/python3"));
        assert_eq!(location.cgi_interpreter("rb"), None);
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("10m"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }
}
