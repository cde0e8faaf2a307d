//! A single-threaded HTTP origin server with a CGI gateway.
//!
//! Call it like this:
//!
//!     reactor-httpd -f config.toml
//!
//! The config file is in the [TOML format][toml]. Top-level keys form the
//! global scope, every `[[server]]` block opens a listening address, and
//! location blocks refine a server for a URI prefix:
//!
//! ```toml
//! timeout = 30
//!
//! [[server]]
//! listen = 8080
//! server_name = ["example.com"]
//! root = "/srv/www"
//! index = ["index.html"]
//! error_page = { 404 = "/errors/404.html" }
//!
//! [server.location."/cgi-bin"]
//! cgi_enabled = true
//! cgi_ext = { py = "/usr/bin/python3", sh = "" }
//! cgi_timeout = 10
//!
//! [server.location."/uploads"]
//! allowed_methods = ["GET", "POST", "DELETE"]
//! upload_store = "uploads"
//! client_max_body_size = "10M"
//!
//! [server.location."/old"]
//! redirect = [301, "/new"]
//! ```
//!
//! Every response closes its connection. Logging goes to stderr at `info`
//! unless `SERVER_LOG` says otherwise.
//!
//! [toml]: https://github.com/toml-lang/toml

#[macro_use] extern crate log;

mod cgi;
mod config;
mod errors;
mod filesystem;
mod http;
mod log_util;
mod reactor;
mod server;

use config::parser::{self, parse_file};
use server::serve;

use clap::{Arg, Command};

use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::process::exit;

const DEFAULT_CONFIG: &str = "/etc/reactor-httpd/config.toml";

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(log::LevelFilter::Info);

    if let Ok(var) = env::var("SERVER_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        let _ = writeln!(stderr(), "reactor-httpd: Error when initializing logging: {}", e);
        exit(1);
    }

    let matches = Command::new("reactor-httpd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Alex Hill <alexander.d.hill.89@gmail.com>")
        .about("Serves files and CGI scripts from a single-threaded reactor")
        .arg(Arg::new("config_file")
             .short('f')
             .long("config")
             .value_name("FILE")
             .help("The TOML file with server configuration")
             .value_parser(clap::value_parser!(PathBuf))
             .default_value(DEFAULT_CONFIG))
        .get_matches();

    let config_file = matches.get_one::<PathBuf>("config_file")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = match parse_file(&config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Parse(e)) => {
            error!("Errors parsing config file {:?}", config_file);
            for error in e {
                error!("Config file error at line {} column {}: {}",
                       error.line, error.column, error.desc);
            }
            exit(1);
        },
        Err(parser::Error::Validation(message)) => {
            error!("Error in config file: {}", message);
            exit(1);
        }
    };

    info!("Starting {} with {} server block(s)", http::SERVER_SOFTWARE, config.servers.len());
    if let Err(e) = serve(config) {
        error!("Server stopped: {}", e);
        exit(1);
    }
}
