// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use dsi_client::{Session, SessionConfig};

static APP: &'static str = "dsistatus";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u16 = dsi_client::config::DSI_DEFAULT_PORT;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Open a DSI session and print the server's status block")
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
                .help("TCP port for remote server (Default: 548)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Milliseconds to wait for each response (0 waits forever)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log every packet")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn hexdump(bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let text: String = chunk
            .iter()
            .map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    *b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:08x}  {:<47}  {}", i * 16, hex.join(" "), text);
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });

    let mut config = SessionConfig::default();
    if let Ok(timeout) = value_t!(matches, "timeout", u64) {
        config.request_timeout_ms = timeout;
    }

    let level = if matches.is_present("verbose") {
        Level::Trace
    } else {
        Level::Info
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let session = Session::open(addr, &config, Some(&log))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to open DSI session: {}", e);
            process::exit(1)
        });

    for opt in session.server_options() {
        println!("server option {:#04x}: {:02x?}", opt.option_type(), opt.data());
    }

    match session.get_status().await {
        Ok(status) => hexdump(&status),
        Err(e) => eprintln!("Error: {}", e),
    }

    session.close().await;
}
