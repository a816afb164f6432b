extern crate clap;
extern crate layerfract;
extern crate tracing;
extern crate tracing_subscriber;

use clap::{App, Arg, ArgMatches};
use std::net::TcpListener;
use std::str::FromStr;
use tracing::Level;

use layerfract::{server, CalcResult, Engine};

fn validate_range<T: FromStr + Ord>(
    s: &str,
    low: T,
    high: T,
    isnotanumber_err: &str,
    isnotinrange_err: &str,
) -> Result<(), String> {
    match T::from_str(s) {
        Ok(i) => {
            if i >= low && i <= high {
                Ok(())
            } else {
                Err(isnotinrange_err.to_string())
            }
        }
        Err(_) => Err(isnotanumber_err.to_string()),
    }
}

const PORT: &str = "port";
const ENGINE: &str = "engine";
const WORKERS: &str = "workers";
const VERBOSE: &str = "verbose";

fn args<'a>() -> ArgMatches<'a> {
    App::new("lfractd")
        .version("0.1.0")
        .author("elf")
        .about("Fractal worker serving batches to remote renderers")
        .arg(
            Arg::with_name(PORT)
                .required(false)
                .long(PORT)
                .short("p")
                .takes_value(true)
                .default_value("7979")
                .validator(|s| {
                    validate_range(
                        &s,
                        1024u16,
                        65535u16,
                        "Could not parse port",
                        "Port must be between 1024 and 65535",
                    )
                })
                .help("TCP port to listen on"),
        )
        .arg(
            Arg::with_name(ENGINE)
                .required(false)
                .long(ENGINE)
                .short("e")
                .takes_value(true)
                .default_value("s")
                .validator(|s| match s.as_str() {
                    "s" | "c" | "g" | "t" => Ok(()),
                    _ => Err("Engine must be one of s, c, g, t".to_string()),
                })
                .help("Engine evaluating the batches this worker receives"),
        )
        .arg(
            Arg::with_name(WORKERS)
                .required(false)
                .long(WORKERS)
                .short("w")
                .takes_value(true)
                .default_value("2")
                .validator(|s| {
                    validate_range(
                        &s,
                        1,
                        256,
                        "Could not parse worker count",
                        "Worker count must be between 1 and 256",
                    )
                })
                .help("Worker threads for the threaded engine"),
        )
        .arg(
            Arg::with_name(VERBOSE)
                .required(false)
                .long(VERBOSE)
                .short("v")
                .takes_value(false)
                .help("Log batch-level detail"),
        )
        .get_matches()
}

fn run(matches: &ArgMatches) -> CalcResult<()> {
    let port = u16::from_str(matches.value_of(PORT).unwrap()).expect("Error parsing port");
    let workers =
        usize::from_str(matches.value_of(WORKERS).unwrap()).expect("Error parsing worker count");
    let engine = Engine::from_code(matches.value_of(ENGINE).unwrap(), workers, &[])?;
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    server::serve(listener, &engine)
}

fn main() {
    let matches = args();
    let level = if matches.is_present(VERBOSE) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = run(&matches) {
        eprintln!("worker failure: {}", e);
        std::process::exit(1);
    }
}
