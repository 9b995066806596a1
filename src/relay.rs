use crate::{
    client_config::RelayConfig,
    half_close::{Action, Event, HalfCloseState},
};
use std::cell::RefCell;
use thiserror::Error;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stdin")]
    Stdin(#[source] std::io::Error),
    #[error("socket")]
    Socket(#[source] std::io::Error),
    #[error("stdout")]
    Stdout(#[source] std::io::Error),
}

/// Copies bytes between the standard streams and a connected socket.
///
/// Both directions are pumped from the same task, so the half-close state is only ever touched
/// from one place at a time and is never borrowed across an await.
pub struct Relay {
    config: RelayConfig,
    state: RefCell<HalfCloseState>,
}

impl Relay {
    const BUFFER_SIZE: usize = 16 * 1024;

    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: RefCell::default(),
        }
    }

    /// Relays between the process' standard streams and `conn`.
    pub async fn run_stdio(self, conn: TcpStream) -> Result<(), RelayError> {
        let (socket_rx, socket_tx) = conn.into_split();
        self.run(io::stdin(), io::stdout(), socket_rx, socket_tx).await
    }

    /// Runs until stdin, the socket and stdout have all ended, or until any of them fails.
    pub async fn run<I, O, R, W>(
        self,
        stdin: I,
        stdout: O,
        socket_rx: R,
        socket_tx: W,
    ) -> Result<(), RelayError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (stop_tx, stop_rx) = watch::channel(());

        tokio::try_join!(
            self.forward_input(stdin, socket_tx, stop_rx),
            self.forward_output(socket_rx, stdout, &stop_tx),
        )?;

        self.notify(Event::SocketClosed);
        log::info!("socket:close");
        debug_assert!(self.state.borrow().all_ended());

        Ok(())
    }

    fn notify(&self, event: Event) -> Vec<Action> {
        self.state
            .borrow_mut()
            .apply(event, self.config.auto_close_stdin)
    }

    async fn forward_input<I, W>(
        &self,
        mut stdin: I,
        mut socket_tx: W,
        mut stop: watch::Receiver<()>,
    ) -> Result<(), RelayError>
    where
        I: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0; Self::BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                biased;
                Ok(()) = stop.changed() => {
                    log::info!("stdin:close");
                    break;
                }
                read = stdin.read(&mut buf) => read.map_err(RelayError::Stdin)?,
            };
            if n == 0 {
                log::info!("stdin:end");
                break;
            }

            log::debug!("stdin:data ({} bytes)", n);
            if self.notify(Event::StdinData).contains(&Action::WriteSocket) {
                socket_tx
                    .write_all(&buf[..n])
                    .await
                    .map_err(RelayError::Socket)?;
            } else {
                log::debug!("stdin:data dropped, socket already ended");
            }
        }

        if self.notify(Event::StdinEnded).contains(&Action::ShutdownSocket) {
            socket_tx.shutdown().await.map_err(RelayError::Socket)?;
            log::info!("socket:finish");
        }

        Ok(())
    }

    async fn forward_output<R, O>(
        &self,
        mut socket_rx: R,
        mut stdout: O,
        stop_stdin: &watch::Sender<()>,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut buf = vec![0; Self::BUFFER_SIZE];

        loop {
            let n = socket_rx.read(&mut buf).await.map_err(RelayError::Socket)?;
            if n == 0 {
                break;
            }

            log::debug!("socket:data ({} bytes)", n);
            if self.notify(Event::SocketData).contains(&Action::WriteStdout) {
                stdout
                    .write_all(&buf[..n])
                    .await
                    .map_err(RelayError::Stdout)?;
                stdout.flush().await.map_err(RelayError::Stdout)?;
            } else {
                log::debug!("socket:data dropped, stdout already closed");
            }
        }

        log::info!("socket:end");
        for action in self.notify(Event::SocketEnded) {
            match action {
                Action::ShutdownStdout => {
                    stdout.shutdown().await.map_err(RelayError::Stdout)?;
                    self.notify(Event::StdoutClosed);
                    log::info!("stdout:close");
                }
                Action::StopStdin => {
                    if stop_stdin.send(()).is_err() {
                        log::debug!("stdin already stopped");
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };
    use tokio::{io::ReadBuf, time};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn relay(auto_close_stdin: bool) -> Relay {
        Relay::new(RelayConfig {
            auto_close_stdin,
            verbosity: 0,
        })
    }

    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn echoes_through_half_closed_socket() {
        let (client, mut server) = io::duplex(64);
        let (socket_rx, socket_tx) = io::split(client);
        let mut stdout = Vec::<u8>::new();

        let echo = async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await?;
            server.write_all(&received).await?;
            server.shutdown().await?;
            Ok::<_, std::io::Error>(received)
        };
        let session = relay(false).run(&b"hello\n"[..], &mut stdout, socket_rx, socket_tx);

        let (received, relayed) =
            time::timeout(TEST_TIMEOUT, async { tokio::join!(echo, session) })
                .await
                .expect("relay did not finish");

        assert_eq!(received.unwrap(), b"hello\n");
        relayed.unwrap();
        assert_eq!(stdout, b"hello\n");
    }

    #[tokio::test]
    async fn socket_end_stops_open_stdin_when_auto_closing() {
        let (stdin, _stdin_peer) = io::duplex(64);
        let (client, mut server) = io::duplex(64);
        let (socket_rx, socket_tx) = io::split(client);
        let mut stdout = Vec::<u8>::new();

        server.write_all(b"bye\n").await.unwrap();
        drop(server);

        time::timeout(
            TEST_TIMEOUT,
            relay(true).run(stdin, &mut stdout, socket_rx, socket_tx),
        )
        .await
        .expect("stdin was not stopped")
        .unwrap();

        assert_eq!(stdout, b"bye\n");
    }

    #[tokio::test]
    async fn socket_end_leaves_stdin_open_without_auto_close() {
        let (stdin, stdin_peer) = io::duplex(64);
        let (client, server) = io::duplex(64);
        let (socket_rx, socket_tx) = io::split(client);
        let mut stdout = Vec::<u8>::new();
        drop(server);

        {
            let session = relay(false).run(stdin, &mut stdout, socket_rx, socket_tx);
            tokio::pin!(session);

            assert!(
                time::timeout(Duration::from_millis(100), &mut session)
                    .await
                    .is_err(),
                "relay finished while stdin was still open"
            );

            drop(stdin_peer);
            time::timeout(TEST_TIMEOUT, session)
                .await
                .expect("relay did not finish after stdin ended")
                .unwrap();
        }

        assert!(stdout.is_empty());
    }

    #[tokio::test]
    async fn stdout_failure_is_fatal() {
        let (stdin, _stdin_peer) = io::duplex(64);
        let (client, mut server) = io::duplex(64);
        let (socket_rx, socket_tx) = io::split(client);
        server.write_all(b"data").await.unwrap();

        let err = time::timeout(
            TEST_TIMEOUT,
            relay(false).run(stdin, Broken, socket_rx, socket_tx),
        )
        .await
        .unwrap()
        .unwrap_err();

        match err {
            RelayError::Stdout(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stdin_failure_is_fatal() {
        let (client, _server) = io::duplex(64);
        let (socket_rx, socket_tx) = io::split(client);

        let err = time::timeout(
            TEST_TIMEOUT,
            relay(false).run(Broken, Vec::<u8>::new(), socket_rx, socket_tx),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert!(matches!(err, RelayError::Stdin(_)));
    }
}
