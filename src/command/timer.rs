//! Phase deadlines for a command attempt

use std::fmt;
use std::future::pending;
use std::pin::Pin;
use tokio::time::{sleep, Duration, Sleep};

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlinePhase {
    /// Resolution through characteristic discovery
    Connection,
    /// Acknowledgment of the written command
    Write,
}

impl fmt::Display for DeadlinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlinePhase::Connection => write!(f, "connection"),
            DeadlinePhase::Write => write!(f, "write"),
        }
    }
}

/// Two single-shot deadlines of which at most one ever fires.
///
/// Once a deadline has fired both are disarmed, later arming is ignored and
/// [`TimerGuard::expired`] never resolves again.
#[derive(Debug, Default)]
pub struct TimerGuard {
    connection: Option<Pin<Box<Sleep>>>,
    write: Option<Pin<Box<Sleep>>>,
    fired: Option<DeadlinePhase>,
}

impl TimerGuard {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the connection-phase deadline, relative to now
    pub fn arm_connection(&mut self, timeout: Duration) {
        if self.fired.is_none() {
            self.connection = Some(Box::pin(sleep(timeout)));
        }
    }

    /// Start the write-phase deadline, relative to now
    pub fn arm_write(&mut self, timeout: Duration) {
        if self.fired.is_none() {
            self.write = Some(Box::pin(sleep(timeout)));
        }
    }

    /// Disarm the connection deadline. Returns false if there was nothing to
    /// cancel, including when a deadline already fired.
    pub fn cancel_connection(&mut self) -> bool {
        self.connection.take().is_some()
    }

    /// Disarm the write deadline, see [`TimerGuard::cancel_connection`]
    pub fn cancel_write(&mut self) -> bool {
        self.write.take().is_some()
    }

    /// Disarm both deadlines
    pub fn cancel_all(&mut self) {
        self.connection = None;
        self.write = None;
    }

    #[cfg(test)]
    pub fn is_armed(&self, phase: DeadlinePhase) -> bool {
        match phase {
            DeadlinePhase::Connection => self.connection.is_some(),
            DeadlinePhase::Write => self.write.is_some(),
        }
    }

    /// The deadline that fired, if any
    #[cfg(test)]
    pub fn fired(&self) -> Option<DeadlinePhase> {
        self.fired
    }

    /// Instant of the earliest armed deadline
    #[cfg(test)]
    pub fn next_deadline(&self) -> Option<tokio::time::Instant> {
        [&self.connection, &self.write]
            .into_iter()
            .flatten()
            .map(|s| s.deadline())
            .min()
    }

    /// Wait for the first armed deadline to fire.
    ///
    /// Cancel safe: dropping the future before it resolves leaves the guard
    /// untouched. Pends forever when nothing is armed.
    pub async fn expired(&mut self) -> DeadlinePhase {
        if self.fired.is_some() {
            return pending().await;
        }

        let phase = match (self.connection.as_mut(), self.write.as_mut()) {
            (None, None) => return pending().await,
            (Some(connection), None) => {
                connection.await;
                DeadlinePhase::Connection
            }
            (None, Some(write)) => {
                write.await;
                DeadlinePhase::Write
            }
            (Some(connection), Some(write)) => {
                tokio::select! {
                    biased;
                    _ = write => DeadlinePhase::Write,
                    _ = connection => DeadlinePhase::Connection,
                }
            }
        };

        self.cancel_all();
        self.fired = Some(phase);
        phase
    }
}
