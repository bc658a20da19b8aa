// Copyright 2020 Joyent, Inc.

use std::fs;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use hadoop_ipc::proto::RequestHeaderProto;
use hadoop_ipc::security::Credentials;
use hadoop_ipc::{Client, ClientConfig, User};

static APP: &'static str = "ipccall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 8032;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a Hadoop IPC method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 8032)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON client configuration file")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("protocol")
                .help("Protocol name declaring the method")
                .long("protocol")
                .short("P")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("version")
                .help("Client protocol version (Default: 1)")
                .long("protocol-version")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("user")
                .help("User to call as (Default: the process user)")
                .long("user")
                .short("u")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("token_file")
                .help("Hadoop token storage file")
                .long("token-file")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn exit_with<E: std::fmt::Display>(context: &str, e: E) -> ! {
    eprintln!("{}: {}", context, e);
    process::exit(1)
}

fn main() {
    let matches = parse_opts(APP.to_string());

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    );

    let mut config = match matches.value_of("config") {
        Some(path) => {
            let json = fs::read_to_string(path)
                .unwrap_or_else(|e| exit_with("Failed to read config", e));
            ClientConfig::from_json(&json)
                .unwrap_or_else(|e| exit_with("Invalid config", e))
        }
        None => ClientConfig::default(),
    };
    if matches.is_present("host") || matches.is_present("port") {
        let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
        let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
        config.server_address = [host, ":", &port.to_string()].concat();
    }

    let mut user = match matches.value_of("user") {
        Some(name) => User::new(name),
        None => User::current()
            .unwrap_or_else(|e| exit_with("Failed to determine user", e)),
    };
    if let Some(path) = matches.value_of("token_file") {
        let credentials = Credentials::read_token_storage_file(path)
            .unwrap_or_else(|e| exit_with("Failed to load tokens", e));
        user = user.with_credentials(credentials);
    }

    let procedure = RequestHeaderProto {
        method_name: String::from(matches.value_of("method").unwrap_or_default()),
        declaring_class_protocol_name: String::from(
            matches.value_of("protocol").unwrap_or_default(),
        ),
        client_protocol_version: value_t!(matches, "version", u64)
            .unwrap_or(1),
    };

    let client = Client::new(config, Arc::new(user), Some(&root_log));

    // The request and response bodies are empty messages; any fields the
    // server sends back are skipped.
    let mut response = ();
    match client.call(&procedure, &(), &mut response) {
        Ok(()) => println!(
            "{} on {} succeeded",
            procedure.method_name,
            client.server_address()
        ),
        Err(e) => exit_with("Error", e),
    }
}
