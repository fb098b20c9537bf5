//! Command line and logging setup for the irked daemon.

#![forbid(unsafe_code)]
#![warn(clippy::all, rust_2018_idioms)]

use irked::Settings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

fn cli() -> clap::App<'static, 'static> {
    clap::App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            clap::Arg::with_name("level")
                .short("d")
                .value_name("LEVEL")
                .help("Log verbosity: 0 errors, 1 events, 2 protocol"),
        )
        .arg(
            clap::Arg::with_name("log-file")
                .short("l")
                .value_name("PATH")
                .help("Log to PATH instead of stderr"),
        )
        .arg(
            clap::Arg::with_name("nick")
                .short("n")
                .value_name("NICK")
                .help("Default IRC nick (target URLs can override it)"),
        )
        .arg(
            clap::Arg::with_name("port")
                .short("p")
                .value_name("PORT")
                .help("Request listener TCP port"),
        )
        .arg(
            clap::Arg::with_name("address")
                .short("i")
                .value_name("ADDR")
                .help("Request listener bind address"),
        )
        .arg(
            clap::Arg::with_name("socket")
                .short("u")
                .long("socket")
                .value_name("PATH")
                .help("Also listen for requests on a UNIX-domain socket at PATH"),
        )
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{}: {}", env!("CARGO_PKG_NAME"), msg);
    process::exit(2)
}

fn main() {
    let matches = cli().get_matches_safe().unwrap_or_else(|err| {
        use clap::ErrorKind::{HelpDisplayed, VersionDisplayed};

        match err.kind {
            HelpDisplayed | VersionDisplayed => err.exit(),
            _ => usage_error(&err.message),
        }
    });

    let verbosity = match matches.value_of("level").unwrap_or("1") {
        "0" => "warn",
        "1" => "info",
        "2" => "trace",
        other => usage_error(&format!("bad log verbosity {:?}, expected 0, 1 or 2", other)),
    };

    let log_settings = env_logger::Env::new()
        .filter_or("IRKED_LOG", format!("irked={}", verbosity))
        .write_style("IRKED_LOG_STYLE");
    let mut log_builder = env_logger::Builder::from_env(log_settings);
    log_builder.format(|buf, r| {
        use std::io::Write;
        writeln!(buf, "[{:<5} {}] {}", r.level(), r.target(), r.args())
    });
    if let Some(path) = matches.value_of("log-file") {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap_or_else(|err| {
                eprintln!("{}: cannot open log file {}: {}", env!("CARGO_PKG_NAME"), path, err);
                process::exit(1);
            });
        log_builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    log_builder.init();

    let mut settings = Settings::default();
    if let Some(nick) = matches.value_of("nick") {
        settings.nick = nick.to_owned();
    }
    if let Some(port) = matches.value_of("port") {
        let port = port
            .parse()
            .unwrap_or_else(|_| usage_error(&format!("bad port {:?}", port)));
        settings.bind.set_port(port);
    }
    if let Some(addr) = matches.value_of("address") {
        let ip = addr
            .parse()
            .unwrap_or_else(|_| usage_error(&format!("bad bind address {:?}", addr)));
        settings.bind = SocketAddr::new(ip, settings.bind.port());
    }
    settings.socket_path = matches.value_of("socket").map(PathBuf::from);

    log::info!("{} {} starting", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    irked::start(settings);
}
