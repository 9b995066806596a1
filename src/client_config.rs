use anyhow::Context;
use clap::{ArgAction, Parser};
use serde_derive::Serialize;
use std::{
    fmt,
    io::{self, IsTerminal},
    net::{IpAddr, SocketAddr},
    time::Duration,
};

/// A TCP client relaying standard input and output over a socket.
///
/// Unlike nc/netcat, this is only a socket client and cannot listen.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Remote host, or the port when it is the only positional argument.
    #[arg(value_name = "HOST")]
    first: Option<String>,

    /// Remote port.
    #[arg(value_name = "PORT")]
    second: Option<String>,

    /// Close stdin when the socket is ended by the server.
    ///
    /// This option is turned on automatically if stdin is a terminal.
    #[arg(short, long)]
    close: bool,

    /// Connect timeout in seconds (fractions allowed).
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        value_parser = parse_wait,
        allow_negative_numbers = true
    )]
    wait: Option<Duration>,

    /// Verbosity level (can be used several times).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Connect over IPv4 only.
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Connect over IPv6 only.
    #[arg(short = '6')]
    ipv6: bool,
}

fn parse_wait(value: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid timeout option value ({:?})", value);
    let seconds: f64 = value.trim().parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(invalid());
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Whatever the resolver returns first.
    Unspecified,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn is_pinned(self) -> bool {
        self != AddressFamily::Unspecified
    }

    pub fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Unspecified => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }

    fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AddressFamily::Unspecified => "any",
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTarget {
    pub host: Option<String>,
    pub port: u16,
    pub family: AddressFamily,
}

impl ConnectionTarget {
    const DEFAULT_HOST: &'static str = "localhost";

    /// Host passed to the resolver.
    pub fn resolvable_host(&self) -> &str {
        self.host.as_deref().unwrap_or(Self::DEFAULT_HOST)
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.as_deref() {
            Some(host) if host.contains(':') => write!(f, "[{}]:{}", host, self.port),
            Some(host) => write!(f, "{}:{}", host, self.port),
            None => write!(f, ":{}", self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectConfig {
    pub target: ConnectionTarget,
    /// Bounds the total time spent connecting, retries included.
    pub timeout: Option<Duration>,
    pub verbosity: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    pub auto_close_stdin: bool,
    pub verbosity: u8,
}

pub struct ClientConfig {
    pub connect: ConnectConfig,
    pub relay: RelayConfig,
}

impl ClientConfig {
    pub fn from_args(args: Args, stdin_is_terminal: bool) -> anyhow::Result<Self> {
        let (host, port) = match (args.first, args.second) {
            (Some(host), Some(port)) => (Some(host), port),
            (Some(port), None) => (None, port),
            _ => anyhow::bail!("missing argument (port)"),
        };
        let port = parse_port(&port)?;

        let requested = match (args.ipv4, args.ipv6) {
            (true, _) => AddressFamily::Ipv4,
            (_, true) => AddressFamily::Ipv6,
            _ => AddressFamily::Unspecified,
        };
        let family = match host.as_deref().and_then(|h| h.parse::<IpAddr>().ok()) {
            Some(ip) => {
                let literal = AddressFamily::of(&ip);
                if requested.is_pinned() && requested != literal {
                    anyhow::bail!("{} is not an {} address", ip, requested);
                }
                literal
            }
            None => requested,
        };

        Ok(Self {
            connect: ConnectConfig {
                target: ConnectionTarget { host, port, family },
                timeout: args.wait,
                verbosity: args.verbose,
            },
            relay: RelayConfig {
                auto_close_stdin: args.close || stdin_is_terminal,
                verbosity: args.verbose,
            },
        })
    }
}

impl TryFrom<Args> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        Self::from_args(args, io::stdin().is_terminal())
    }
}

fn parse_port(value: &str) -> anyhow::Result<u16> {
    let port: u16 = value
        .parse()
        .with_context(|| format!("invalid port {:?}", value))?;
    if port == 0 {
        anyhow::bail!("invalid port {:?}", value);
    }

    Ok(port)
}
