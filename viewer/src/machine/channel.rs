//! Connection state machine for the chat channel.
//!
//! The machine performs no I/O. Each transition returns the [`ChannelCommand`]s the driver in
//! [`crate::background::chat`] has to carry out, which keeps every transition testable without
//! sockets or timers.

use crate::config::ReconnectPolicy;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// User-visible connection status shown under the chat box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatStatus {
    #[default]
    Clear,
    /// The socket reported an error; a close (and possibly a retry) follows.
    ConnectFailed,
    Reconnecting {
        attempt: u32,
    },
    /// Retries are used up. Terminal until the page (session) is recreated.
    Exhausted,
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatStatus::Clear => Ok(()),
            ChatStatus::ConnectFailed => f.write_str("Chat failed to connect... trying again"),
            ChatStatus::Reconnecting { attempt } => {
                write!(f, "Reconnecting to chat... attempt {attempt}")
            }
            ChatStatus::Exhausted => f.write_str("Unable to reconnect. Please refresh."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Open a new socket. Any previous socket has already been hung up.
    Dial,
    /// Arm the reconnect timer; fire [`ChannelMachine::on_retry_due`] when it expires.
    ScheduleRetry(Duration),
    CancelRetry,
    /// Close the current socket without treating it as a failure.
    Hangup,
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
    state: ConnectionState,
    /// Consecutive failed connections since the last successful open.
    attempts: u32,
    retry_pending: bool,
    status: ChatStatus,
    policy: ReconnectPolicy,
}

impl ChannelMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            retry_pending: false,
            status: ChatStatus::Clear,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn status(&self) -> ChatStatus {
        self.status
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// The room went live (or the caller asked to connect).
    ///
    /// Idempotent while a socket exists or a retry is already scheduled.
    pub fn request_open(&mut self) -> Vec<ChannelCommand> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => Vec::new(),
            ConnectionState::Closed if self.retry_pending => Vec::new(),
            ConnectionState::Idle | ConnectionState::Closed => {
                self.state = ConnectionState::Connecting;
                vec![ChannelCommand::Dial]
            }
        }
    }

    /// The room went offline or the session is being torn down.
    pub fn request_close(&mut self) -> Vec<ChannelCommand> {
        let mut commands = Vec::new();
        if std::mem::take(&mut self.retry_pending) {
            commands.push(ChannelCommand::CancelRetry);
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            commands.push(ChannelCommand::Hangup);
        }
        if self.status != ChatStatus::Exhausted {
            self.status = ChatStatus::Clear;
        }
        self.state = ConnectionState::Idle;
        commands
    }

    pub fn on_open(&mut self) -> Vec<ChannelCommand> {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
            self.attempts = 0;
            self.status = ChatStatus::Clear;
        }
        Vec::new()
    }

    pub fn on_error(&mut self) -> Vec<ChannelCommand> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.status = ChatStatus::ConnectFailed;
        }
        Vec::new()
    }

    /// The socket closed (or never opened) without us asking for it.
    pub fn on_close(&mut self) -> Vec<ChannelCommand> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            // we hung up ourselves, or this close was already accounted for
            return Vec::new();
        }

        self.state = ConnectionState::Closed;
        if self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay(self.attempts);
            self.attempts += 1;
            self.retry_pending = true;
            self.status = ChatStatus::Reconnecting {
                attempt: self.attempts,
            };
            vec![ChannelCommand::ScheduleRetry(delay)]
        } else {
            self.status = ChatStatus::Exhausted;
            Vec::new()
        }
    }

    pub fn on_retry_due(&mut self) -> Vec<ChannelCommand> {
        if self.state == ConnectionState::Closed && std::mem::take(&mut self.retry_pending) {
            self.state = ConnectionState::Connecting;
            vec![ChannelCommand::Dial]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn machine() -> ChannelMachine {
        ChannelMachine::new(ReconnectPolicy::default())
    }

    fn retry_delay(commands: &[ChannelCommand]) -> Option<u128> {
        match commands {
            [ChannelCommand::ScheduleRetry(d)] => Some(d.as_millis()),
            _ => None,
        }
    }

    #[test]
    fn open_is_idempotent() {
        let mut m = machine();
        assert_eq!(m.request_open(), vec![ChannelCommand::Dial]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.request_open(), vec![]);
        m.on_open();
        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.request_open(), vec![]);
    }

    #[test]
    fn backoff_sequence_then_exhausted() {
        let mut m = machine();
        m.request_open();

        let mut delays = Vec::new();
        for attempt in 1..=5 {
            let commands = m.on_close();
            delays.push(retry_delay(&commands).expect("retry scheduled"));
            assert_eq!(m.status(), ChatStatus::Reconnecting { attempt });
            assert_eq!(
                m.status().to_string(),
                format!("Reconnecting to chat... attempt {attempt}")
            );
            assert_eq!(m.on_retry_due(), vec![ChannelCommand::Dial]);
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000]);

        // the sixth failure gives up
        assert_eq!(m.on_close(), vec![]);
        assert_eq!(m.state(), ConnectionState::Closed);
        assert!(!m.retry_pending());
        assert_eq!(m.status(), ChatStatus::Exhausted);
        assert_eq!(m.status().to_string(), "Unable to reconnect. Please refresh.");
        assert_eq!(m.on_retry_due(), vec![]);
    }

    #[test]
    fn success_resets_backoff() {
        let mut m = machine();
        m.request_open();
        m.on_close();
        m.on_retry_due();
        m.on_close();
        m.on_retry_due();
        assert_eq!(m.attempts(), 2);

        m.on_open();
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.status(), ChatStatus::Clear);
        assert_eq!(m.status().to_string(), "");

        assert_eq!(retry_delay(&m.on_close()), Some(1000));
        assert_eq!(m.status(), ChatStatus::Reconnecting { attempt: 1 });
    }

    #[test]
    fn error_then_close() {
        let mut m = machine();
        m.request_open();
        m.on_error();
        assert_eq!(
            m.status().to_string(),
            "Chat failed to connect... trying again"
        );
        m.on_close();
        assert_eq!(m.status(), ChatStatus::Reconnecting { attempt: 1 });
    }

    #[test]
    fn requested_close_is_graceful() {
        let mut m = machine();
        m.request_open();
        m.on_open();
        assert_eq!(m.request_close(), vec![ChannelCommand::Hangup]);
        assert_eq!(m.state(), ConnectionState::Idle);

        // the socket reporting its close afterwards does not trigger a reconnect
        assert_eq!(m.on_close(), vec![]);
        assert_eq!(m.state(), ConnectionState::Idle);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn close_cancels_pending_retry() {
        let mut m = machine();
        m.request_open();
        m.on_close();
        assert!(m.retry_pending());
        // open requests while a retry is scheduled wait for the retry
        assert_eq!(m.request_open(), vec![]);

        assert_eq!(m.request_close(), vec![ChannelCommand::CancelRetry]);
        assert_eq!(m.status(), ChatStatus::Clear);
        assert_eq!(m.on_retry_due(), vec![]);
        assert_eq!(m.state(), ConnectionState::Idle);

        // attempts survive a liveness flip; only a successful open resets them
        assert_eq!(m.request_open(), vec![ChannelCommand::Dial]);
        assert_eq!(retry_delay(&m.on_close()), Some(2000));
    }

    #[test]
    fn exhausted_survives_close_and_reopen() {
        let mut m = machine();
        m.request_open();
        for _ in 0..5 {
            m.on_close();
            m.on_retry_due();
        }
        m.on_close();
        assert_eq!(m.status(), ChatStatus::Exhausted);

        assert_eq!(m.request_close(), vec![]);
        assert_eq!(m.status(), ChatStatus::Exhausted);

        assert_eq!(m.request_open(), vec![ChannelCommand::Dial]);
        assert_eq!(m.on_close(), vec![]);
        assert_eq!(m.status(), ChatStatus::Exhausted);

        m.request_open();
        m.on_open();
        assert_eq!(m.status(), ChatStatus::Clear);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn send_only_when_open() {
        let mut m = machine();
        assert!(!m.can_send());
        m.request_open();
        assert!(!m.can_send());
        m.on_open();
        assert!(m.can_send());
        m.on_close();
        assert!(!m.can_send());
    }
}
