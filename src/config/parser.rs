use super::*;
use toml::{Table, Value};

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Reads and validates the configuration file at `conf`
pub fn parse_file<P: AsRef<Path>>(conf: P) -> Result<Config, Error> {
    let toml = fs::read_to_string(conf)?;
    parse_str(&toml)
}

/// Parses and validates configuration text
pub fn parse_str(toml: &str) -> Result<Config, Error> {
    match toml.parse::<Table>() {
        Ok(table) => config_from_table(table),
        Err(e) => Err(Error::Parse(vec![message_from_error(toml, &e)]))
    }
}

/// Directives allowed in any scope, with the shape they must have
const DIRECTIVES: &[(&str, Shape)] = &[
    ("root", Shape::String),
    ("index", Shape::List),
    ("autoindex", Shape::Boolean),
    ("allowed_methods", Shape::List),
    ("client_max_body_size", Shape::Size),
    ("timeout", Shape::Duration),
    ("cgi_timeout", Shape::Duration),
    ("cgi_enabled", Shape::Boolean),
    ("cgi_ext", Shape::StringTable),
    ("redirect", Shape::Pair),
    ("upload_store", Shape::String),
    ("error_page", Shape::StringTable),
];

#[derive(Debug, Clone, Copy)]
enum Shape {
    String,
    Boolean,
    List,
    Size,
    Duration,
    Pair,
    StringTable
}

impl Shape {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Shape::String => value.is_str(),
            Shape::Boolean => value.is_bool(),
            Shape::List => list_of_value(value).is_some(),
            Shape::Size => size_of_value(value).is_some(),
            Shape::Duration => duration_of_value(value).is_some(),
            Shape::Pair => pair_of_value(value).is_some(),
            Shape::StringTable => value.as_table()
                .map_or(false, |t| t.values().all(Value::is_str))
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Shape::String => "a string",
            Shape::Boolean => "a boolean",
            Shape::List => "a string or an array of strings",
            Shape::Size => "a byte size like 1048576 or \"1M\"",
            Shape::Duration => "a non-negative number of seconds",
            Shape::Pair => "a [code, \"text\"] pair",
            Shape::StringTable => "a table of strings"
        }
    }
}

fn config_from_table(mut table: Table) -> Result<Config, Error> {
    let servers = match table.remove("server") {
        Some(Value::Array(servers)) => servers,
        Some(val) => return Err(Error::Validation(
            format!("Expected `server` to be an array of tables, got a {}",
                    val.type_str())
        )),
        None => return Err(Error::Validation(
            String::from("At least one [[server]] block is required")
        ))
    };

    if servers.is_empty() {
        return Err(Error::Validation(
            String::from("At least one [[server]] block is required")
        ));
    }

    check_directives(&table, "global scope")?;
    let global = Rc::new(Scope::new(ScopeKind::Global, table, None));

    let mut configs = Vec::with_capacity(servers.len());
    for (i, server) in servers.into_iter().enumerate() {
        let server = match server {
            Value::Table(t) => t,
            val => return Err(Error::Validation(
                format!("Expected server #{} to be a table, got a {}",
                        i + 1, val.type_str())
            ))
        };

        configs.push(Rc::new(server_from_table(server, i + 1, &global)?));
    }

    Ok(Config { global, servers: configs })
}

fn server_from_table(mut table: Table, number: usize, global: &Rc<Scope>)
                     -> Result<ServerConfig, Error>
{
    let context = format!("server #{}", number);

    let port = match table.remove("listen") {
        Some(Value::Integer(p)) if p <= u16::MAX as i64 && p >= 0 => p as u16,
        Some(Value::Integer(p)) => return Err(Error::Validation(
            format!("The port {} of {} is out of range", p, context)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected `listen` of {} to be an integer, got a {}",
                    context, val.type_str())
        )),
        None => return Err(Error::Validation(
            format!("{} has no `listen` port", context)
        ))
    };

    let host = match table.remove("host") {
        Some(Value::String(h)) => h.parse::<IpAddr>().map_err(|e| Error::Validation(
            format!("The host {:?} of {} is not an IP address: {}", h, context, e)
        ))?,
        Some(val) => return Err(Error::Validation(
            format!("Expected `host` of {} to be a string, got a {}",
                    context, val.type_str())
        )),
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };

    let names = match table.remove("server_name") {
        Some(val) => list_of_value(&val).ok_or_else(|| Error::Validation(
            format!("Expected `server_name` of {} to be a string or an array \
                     of strings, got a {}", context, val.type_str())
        ))?,
        None => Vec::new()
    };

    let locations = match table.remove("location") {
        Some(Value::Table(t)) => t,
        Some(val) => return Err(Error::Validation(
            format!("Expected `location` of {} to be a table, got a {}",
                    context, val.type_str())
        )),
        None => Table::new()
    };

    check_directives(&table, &context)?;
    let scope = Rc::new(Scope::new(ScopeKind::Server, table,
                                   Some(global.clone())));

    let mut location_scopes = Vec::with_capacity(locations.len());
    for (prefix, block) in locations {
        if !prefix.starts_with('/') {
            return Err(Error::Validation(
                format!("Location {:?} of {} must start with '/'",
                        prefix, context)
            ));
        }

        let block = match block {
            Value::Table(t) => t,
            val => return Err(Error::Validation(
                format!("Expected location {:?} of {} to be a table, got a {}",
                        prefix, context, val.type_str())
            ))
        };

        check_directives(&block, &format!("location {:?} of {}", prefix, context))?;
        location_scopes.push(Rc::new(Scope::new(ScopeKind::Location(prefix), block,
                                                Some(scope.clone()))));
    }

    Ok(ServerConfig::new(scope, location_scopes, host, port, names))
}

/// Rejects known directives of the wrong shape; unknown ones are only logged
fn check_directives(table: &Table, context: &str) -> Result<(), Error> {
    for (name, value) in table {
        match DIRECTIVES.iter().find(|&&(known, _)| known == name) {
            Some(&(_, shape)) if !shape.accepts(value) => {
                return Err(Error::Validation(
                    format!("Expected `{}` in {} to be {}, got a {}",
                            name, context, shape.describe(), value.type_str())
                ));
            },
            Some(_) => (),
            None => warn!("Ignoring unknown directive `{}` in {}", name, context)
        }
    }

    if let Some(pages) = table.get("error_page").and_then(Value::as_table) {
        for code in pages.keys() {
            match code.parse::<u16>() {
                Ok(c) if (300 .. 600).contains(&c) => (),
                _ => return Err(Error::Validation(
                    format!("`error_page` in {} has an invalid status code {:?}",
                            context, code)
                ))
            }
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),
    #[error("{} syntax error(s)", .0.len())]
    Parse(Vec<ErrorMessage>),
    #[error("{0}")]
    Validation(String)
}

/// An owned, rendered version of a TOML syntax error
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize
}

/// Convert a `toml::de::Error` into an `ErrorMessage`
fn message_from_error(toml: &str, error: &toml::de::Error) -> ErrorMessage {
    let (line, column) = match error.span() {
        Some(span) => to_linecol(toml, span.start),
        None => (0, 0)
    };

    ErrorMessage {
        desc: error.message().to_string(),
        line,
        column
    }
}

/// Zero-based line and column of a byte offset
fn to_linecol(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[.. offset.min(text.len())];
    let line = before.matches('\n').count();
    let column = before.len() - before.rfind('\n').map_or(0, |i| i + 1);
    (line, column)
}

#[cfg(test)]
mod test {
    use super::*;

    const BASIC: &str = r#"
        client_max_body_size = "1M"

        [[server]]
        listen = 8080
        host = "127.0.0.1"
        server_name = ["example.com", "www.example.com"]
        root = "/srv/www"
        index = "index.html"

        [server.location."/"]
        allowed_methods = ["GET"]

        [server.location."/cgi-bin"]
        cgi_enabled = true
        cgi_ext = { py = "/usr/bin/python3" }

        [[server]]
        listen = 8081
        root = "/srv/other"
    "#;

    #[test]
    fn parses_servers_and_locations() {
        let config = parse_str(BASIC).unwrap();

        assert_eq!(config.servers.len(), 2);
        let first = &config.servers[0];
        assert_eq!(first.listen_addr(), "127.0.0.1:8080".parse().unwrap());
        assert!(first.answers_to("WWW.example.com"));
        assert!(!first.answers_to("example.org"));

        let prefixes: Vec<_> = first.locations().iter()
            .map(|l| l.location().unwrap().to_string())
            .collect();
        assert_eq!(prefixes, vec!["/", "/cgi-bin"]);

        let cgi = &first.locations()[1];
        assert_eq!(cgi.max_body_size(), 1024 * 1024);
        assert_eq!(cgi.root(), Some(PathBuf::from("/srv/www")));

        let second = &config.servers[1];
        assert_eq!(second.listen_addr().ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn requires_a_server() {
        match parse_str("root = \"/srv\"") {
            Err(Error::Validation(_)) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn rejects_out_of_range_ports() {
        match parse_str("[[server]]\nlisten = 70000\n") {
            Err(Error::Validation(message)) => assert!(message.contains("70000")),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn rejects_wrongly_typed_directives() {
        let toml = "[[server]]\nlisten = 80\nautoindex = \"yes\"\n";
        match parse_str(toml) {
            Err(Error::Validation(message)) => assert!(message.contains("autoindex")),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn rejects_unrepresentable_timeouts() {
        for timeout in ["1e300", "-0.5", "nan", "inf"] {
            let toml = format!("[[server]]\nlisten = 80\ncgi_timeout = {}\n", timeout);
            match parse_str(&toml) {
                Err(Error::Validation(message)) => assert!(message.contains("cgi_timeout"),
                                                           "{}", message),
                other => panic!("{}: {:?}", timeout, other)
            }
        }
    }

    #[test]
    fn rejects_relative_locations() {
        let toml = "[[server]]\nlisten = 80\n[server.location.images]\nroot = \"/x\"\n";
        assert!(parse_str(toml).is_err());
    }

    #[test]
    fn rejects_bad_error_page_codes() {
        let toml = "[[server]]\nlisten = 80\nerror_page = { 99 = \"/x.html\" }\n";
        assert!(parse_str(toml).is_err());
    }

    #[test]
    fn reports_syntax_error_positions() {
        match parse_str("[[server]]\nlisten = = 80\n") {
            Err(Error::Parse(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].line, 1);
            },
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn linecol_counts_from_zero() {
        assert_eq!(to_linecol("ab\ncd", 4), (1, 1));
        assert_eq!(to_linecol("ab", 0), (0, 0));
    }
}
