use anyhow::Context;
use clap::{error::ErrorKind, Parser};
use ncrs::{
    client_config::{Args, ClientConfig},
    connector::{Connector, TcpDialer},
    relay::Relay,
};
use std::{
    fmt,
    io::{self, Write},
    process::ExitCode,
};
use tokio::runtime::Builder;

/// Exit code used when the diagnostic itself cannot be written to stderr.
const STDERR_FAILURE: u8 = 2;

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    // Bare lines on stderr, stdout only ever carries relayed bytes.
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}

fn run(config: ClientConfig) -> anyhow::Result<()> {
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("opts: {}", serde_json::to_string(&config.relay)?);
        log::debug!("net_opts: {}", serde_json::to_string(&config.connect)?);
    }

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let result = runtime.block_on(async move {
        let conn = Connector::new(config.connect)
            .connect(&mut TcpDialer)
            .await?;
        Relay::new(config.relay).run_stdio(conn).await?;

        Ok::<_, anyhow::Error>(())
    });

    // A read from stdin may still hold one of the runtime's blocking threads.
    runtime.shutdown_background();

    result
}

fn report(message: impl fmt::Display, usage_hint: bool) -> ExitCode {
    let mut stderr = io::stderr().lock();
    let mut written = writeln!(stderr, "error: {}", message);
    if usage_hint {
        written = written.and_then(|()| writeln!(stderr, "\nFor more information, try '--help'."));
    }

    match written {
        Ok(()) => ExitCode::FAILURE,
        Err(_) => ExitCode::from(STDERR_FAILURE),
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
            return match e.print() {
                Ok(()) => code,
                Err(_) => ExitCode::from(STDERR_FAILURE),
            };
        }
    };

    let config = match ClientConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => return report(format_args!("{:#}", e), true),
    };

    init_logger(config.connect.verbosity);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(format_args!("{:#}", e), false),
    }
}
