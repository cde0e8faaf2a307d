//! The CGI/1.1 meta-variables handed to a script

use crate::http::{HttpRequest, SERVER_SOFTWARE};
use crate::server::router::Route;

use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Request headers that already have their own meta-variable
const NOT_FORWARDED: [&str; 2] = ["content-type", "content-length"];

#[derive(Debug, Clone, Default)]
pub struct CgiEnvironment {
    vars: BTreeMap<String, String>
}

impl CgiEnvironment {
    pub fn build(request: &HttpRequest, route: &Route, peer: SocketAddr,
                 local: SocketAddr) -> CgiEnvironment
    {
        let mut env = CgiEnvironment::default();

        env.set("GATEWAY_INTERFACE", "CGI/1.1");
        env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
        env.set("SERVER_PROTOCOL", request.version());
        env.set("REQUEST_METHOD", request.method());
        env.set("REQUEST_SCHEME", "http");
        env.set("REQUEST_URI", request.target());
        env.set("REDIRECT_STATUS", "200");

        env.set("SCRIPT_NAME", &route.script_url);
        if let Some(ref script) = route.script {
            env.set("SCRIPT_FILENAME", &script.to_string_lossy());
        }
        env.set("QUERY_STRING", &route.query);
        env.set("PATH_INFO", &route.path_info);
        if !route.path_info.is_empty() {
            if let Some(root) = route.scope.root() {
                let translated = root.join(route.path_info.trim_start_matches('/'));
                env.set("PATH_TRANSLATED", &translated.to_string_lossy());
            }
        }

        let server_name = request.host()
            .filter(|h| !h.is_empty())
            .map(String::from)
            .unwrap_or_else(|| local.ip().to_string());
        env.set("SERVER_NAME", &server_name);
        env.set("SERVER_PORT", &local.port().to_string());
        env.set("REMOTE_ADDR", &peer.ip().to_string());
        env.set("REMOTE_PORT", &peer.port().to_string());

        if let Some(content_type) = request.headers().get("Content-Type") {
            env.set("CONTENT_TYPE", content_type);
        }
        if !request.body().is_empty() || request.content_length().is_some() {
            env.set("CONTENT_LENGTH", &request.body().len().to_string());
        }

        for (name, _) in request.headers().iter() {
            if NOT_FORWARDED.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                continue;
            }
            if let Some(value) = request.headers().joined(name) {
                env.set(&http_variable(name), &value);
            }
        }

        // Interpreters found through `#!/usr/bin/env` need a search path.
        if let Ok(path) = std::env::var("PATH") {
            env.set("PATH", &path);
        }

        env
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

/// `X-Forwarded-For` becomes `HTTP_X_FORWARDED_FOR`
fn http_variable(header: &str) -> String {
    let mut name = String::with_capacity(header.len() + 5);
    name.push_str("HTTP_");
    name.extend(header.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase()
    }));
    name
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::parser::parse_str;
    use crate::server::router::resolve;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn request(raw: &[u8]) -> HttpRequest {
        let mut request = HttpRequest::default();
        request.receive_data(raw);
        assert!(request.is_complete());
        request
    }

    #[test]
    fn variable_names() {
        assert_eq!(http_variable("X-Forwarded-For"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(http_variable("accept"), "HTTP_ACCEPT");
    }

    #[test]
    fn builds_the_gateway_variables() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("cgi-bin");
        fs::create_dir(&bin).unwrap();
        let script = bin.join("env.py");
        fs::write(&script, "print()").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let config = parse_str(&format!(r#"
            [[server]]
            listen = 0
            root = {:?}
            cgi_enabled = true
            cgi_ext = {{ py = "/usr/bin/python3" }}
        "#, root.path().to_str().unwrap())).unwrap();

        let request = request(b"POST /cgi-bin/env.py/extra/path?a=1&b=2 HTTP/1.1\r\n\
                                Host: example.com:8080\r\n\
                                Content-Type: text/plain\r\n\
                                Content-Length: 3\r\n\
                                Accept: text/html\r\n\
                                accept: text/plain\r\n\
                                X-Custom-Thing: yes\r\n\r\nabc");

        let route = resolve(&config.servers[0], request.target()).unwrap();
        let env = CgiEnvironment::build(&request, &route,
                                        "10.0.0.7:51000".parse().unwrap(),
                                        "127.0.0.1:8080".parse().unwrap());

        assert_eq!(env.get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(env.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/cgi-bin/env.py"));
        assert_eq!(env.get("SCRIPT_FILENAME"), Some(script.to_str().unwrap()));
        assert_eq!(env.get("PATH_INFO"), Some("/extra/path"));
        assert_eq!(env.get("QUERY_STRING"), Some("a=1&b=2"));
        assert_eq!(env.get("REQUEST_URI"), Some("/cgi-bin/env.py/extra/path?a=1&b=2"));
        assert_eq!(env.get("SERVER_NAME"), Some("example.com"));
        assert_eq!(env.get("SERVER_PORT"), Some("8080"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("10.0.0.7"));
        assert_eq!(env.get("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env.get("CONTENT_LENGTH"), Some("3"));
        assert_eq!(env.get("REDIRECT_STATUS"), Some("200"));
        assert_eq!(env.get("HTTP_ACCEPT"), Some("text/html, text/plain"));
        assert_eq!(env.get("HTTP_X_CUSTOM_THING"), Some("yes"));
        assert_eq!(env.get("HTTP_HOST"), Some("example.com:8080"));
        assert_eq!(env.get("HTTP_CONTENT_TYPE"), None);
        assert_eq!(env.get("HTTP_CONTENT_LENGTH"), None);
    }

    #[test]
    fn bodyless_requests_have_no_content_length() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.py"), "").unwrap();

        let config = parse_str(&format!("[[server]]\nlisten = 0\nroot = {:?}\n",
                                        root.path().to_str().unwrap())).unwrap();
        let request = request(b"GET /a.py HTTP/1.0\r\n\r\n");
        let route = resolve(&config.servers[0], request.target()).unwrap();
        let env = CgiEnvironment::build(&request, &route,
                                        "127.0.0.1:4000".parse().unwrap(),
                                        "127.0.0.1:8080".parse().unwrap());

        assert_eq!(env.get("CONTENT_LENGTH"), None);
        assert_eq!(env.get("SERVER_NAME"), Some("127.0.0.1"));
        assert_eq!(env.get("QUERY_STRING"), Some(""));
        assert_eq!(env.get("PATH_INFO"), Some(""));
    }
}
