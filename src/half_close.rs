//! End-of-stream bookkeeping for one relay session.
//!
//! Every stream notification is fed through [`HalfCloseState::apply`], which
//! updates the three ended flags and answers with the I/O the relay has to
//! perform. Keeping this free of I/O lets the write-after-close and
//! close-exactly-once rules be checked without sockets.

/// A notification from one of the three endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    StdinData,
    /// End of input, or stdin was closed.
    StdinEnded,
    SocketData,
    /// The peer half-closed its side of the connection.
    SocketEnded,
    SocketClosed,
    StdoutClosed,
}

/// I/O requested in response to an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    WriteSocket,
    /// Shut down the write side of the socket, leaving the read side open.
    ShutdownSocket,
    WriteStdout,
    ShutdownStdout,
    StopStdin,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HalfCloseState {
    stdin_ended: bool,
    socket_ended: bool,
    stdout_ended: bool,
}

impl HalfCloseState {
    pub fn stdin_ended(&self) -> bool {
        self.stdin_ended
    }

    pub fn socket_ended(&self) -> bool {
        self.socket_ended
    }

    pub fn stdout_ended(&self) -> bool {
        self.stdout_ended
    }

    pub fn all_ended(&self) -> bool {
        self.stdin_ended && self.socket_ended && self.stdout_ended
    }

    /// Records `event` and returns what has to be done about it, in order.
    ///
    /// Repeated end/close notifications for a side that already ended are no-ops.
    pub fn apply(&mut self, event: Event, auto_close_stdin: bool) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            Event::StdinData => {
                if !self.socket_ended {
                    actions.push(Action::WriteSocket);
                }
            }
            Event::StdinEnded => {
                if end(&mut self.stdin_ended) && !self.socket_ended {
                    actions.push(Action::ShutdownSocket);
                }
            }
            Event::SocketData => {
                if !self.stdout_ended {
                    actions.push(Action::WriteStdout);
                }
            }
            Event::SocketEnded => {
                if end(&mut self.socket_ended) {
                    if !self.stdout_ended {
                        actions.push(Action::ShutdownStdout);
                    }
                    if !self.stdin_ended && auto_close_stdin {
                        actions.push(Action::StopStdin);
                    }
                }
            }
            Event::SocketClosed => {
                end(&mut self.socket_ended);
            }
            Event::StdoutClosed => {
                end(&mut self.stdout_ended);
            }
        }

        actions
    }
}

/// Sets `flag`, returning whether this call is the one that ended it.
fn end(flag: &mut bool) -> bool {
    !std::mem::replace(flag, true)
}
