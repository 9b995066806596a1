use crate::client_config::{AddressFamily, ConnectConfig, ConnectionTarget};
use std::{future::Future, io, time::Duration};
use thiserror::Error;
use tokio::{
    net::{self, TcpStream},
    time,
};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve {target}")]
    Resolve {
        target: ConnectionTarget,
        #[source]
        source: io::Error,
    },

    #[error("no {} address found for {target}", .target.family)]
    NoAddress { target: ConnectionTarget },

    #[error("failed to connect to {target}")]
    Failed {
        target: ConnectionTarget,
        #[source]
        source: io::Error,
    },

    #[error(
        "connection timeout ({target}), failed to connect within {} seconds",
        .timeout.as_secs_f64()
    )]
    TimedOut {
        target: ConnectionTarget,
        timeout: Duration,
    },
}

/// Progress of a single connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Resolving,
    ConnectingDefault,
    ConnectingIpv4Retry,
    /// The family was requested by the caller, there is nothing to fall back to.
    ConnectingPinned(AddressFamily),
    Connected,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectEvent {
    Start(AddressFamily),
    Connected,
    Error,
    Deadline,
}

impl ConnectState {
    pub fn next(self, event: ConnectEvent) -> Self {
        use ConnectState::*;

        match (self, event) {
            (Resolving, ConnectEvent::Start(family)) if family.is_pinned() => {
                ConnectingPinned(family)
            }
            (Resolving, ConnectEvent::Start(_)) => ConnectingDefault,
            (ConnectingDefault, ConnectEvent::Error) => ConnectingIpv4Retry,
            (ConnectingIpv4Retry | ConnectingPinned(_), ConnectEvent::Error) => Failed,
            (
                ConnectingDefault | ConnectingIpv4Retry | ConnectingPinned(_),
                ConnectEvent::Connected,
            ) => Connected,
            (
                Resolving | ConnectingDefault | ConnectingIpv4Retry | ConnectingPinned(_),
                ConnectEvent::Deadline,
            ) => TimedOut,
            (state, _) => state,
        }
    }

    /// Family to dial with, `None` outside of the connecting states.
    pub fn family(self) -> Option<AddressFamily> {
        match self {
            ConnectState::ConnectingDefault => Some(AddressFamily::Unspecified),
            ConnectState::ConnectingIpv4Retry => Some(AddressFamily::Ipv4),
            ConnectState::ConnectingPinned(family) => Some(family),
            _ => None,
        }
    }
}

/// Opens a transport to a single target address family.
pub trait Dialer {
    type Stream;

    fn dial(
        &mut self,
        target: &ConnectionTarget,
    ) -> impl Future<Output = Result<Self::Stream, ConnectError>>;
}

/// Dials the first resolved address admitted by the target's family.
#[derive(Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&mut self, target: &ConnectionTarget) -> Result<TcpStream, ConnectError> {
        let addr = net::lookup_host((target.resolvable_host(), target.port))
            .await
            .map_err(|source| ConnectError::Resolve {
                target: target.clone(),
                source,
            })?
            .find(|addr| target.family.admits(addr))
            .ok_or_else(|| ConnectError::NoAddress {
                target: target.clone(),
            })?;

        log::debug!("net:connect(): {} resolved to {}", target, addr);

        let failed = |source| ConnectError::Failed {
            target: target.clone(),
            source,
        };
        let conn = TcpStream::connect(addr).await.map_err(failed)?;
        conn.set_nodelay(true).map_err(failed)?;

        Ok(conn)
    }
}

pub struct Connector {
    config: ConnectConfig,
}

impl Connector {
    pub fn new(config: ConnectConfig) -> Self {
        Self { config }
    }

    /// Connects to the configured target.
    ///
    /// The timeout, if any, covers every attempt together, the IPv4 retry is not given a fresh
    /// deadline. Dropping the attempts on timeout also drops any connect still in flight.
    pub async fn connect<D: Dialer>(&self, dialer: &mut D) -> Result<D::Stream, ConnectError> {
        let mut state = ConnectState::Resolving;

        let result = match self.config.timeout {
            Some(limit) => {
                let outcome = time::timeout(limit, self.attempts(dialer, &mut state)).await;
                outcome.unwrap_or_else(|_| {
                    state = state.next(ConnectEvent::Deadline);
                    Err(ConnectError::TimedOut {
                        target: self.config.target.clone(),
                        timeout: limit,
                    })
                })
            }
            None => self.attempts(dialer, &mut state).await,
        };

        log::trace!("net:connect(): finished in state {:?}", state);
        result
    }

    async fn attempts<D: Dialer>(
        &self,
        dialer: &mut D,
        state: &mut ConnectState,
    ) -> Result<D::Stream, ConnectError> {
        *state = state.next(ConnectEvent::Start(self.config.target.family));

        while let Some(family) = state.family() {
            let target = ConnectionTarget {
                family,
                ..self.config.target.clone()
            };

            match dialer.dial(&target).await {
                Ok(stream) => {
                    *state = state.next(ConnectEvent::Connected);
                    log::info!("socket:connect");
                    return Ok(stream);
                }
                Err(err) => {
                    *state = state.next(ConnectEvent::Error);
                    if *state == ConnectState::Failed {
                        return Err(err);
                    }
                    log::info!("net:connect(): {}, trying {}...", err, AddressFamily::Ipv4);
                }
            }
        }

        unreachable!("connect state machine left the connecting states without an outcome")
    }
}
