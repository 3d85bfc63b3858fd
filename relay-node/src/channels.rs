//! Delivery channels into the host application
//!
//! - Service pipe: in-process listener of the background host
//! - Background broadcast: OS-level intent to the widget callback
//! - Deep link: user-visible navigation as a last resort

use crate::config::URI_PLACEHOLDER;
use crate::message::PipeMessage;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery canceled")]
    Canceled,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("no program configured")]
    NotConfigured,

    #[error("pipe error: {0}")]
    Pipe(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Channel A
#[async_trait]
pub trait ServicePipe: Send + Sync {
    /// A listener is attached on the host side. May be visible to the host,
    /// callers check at most once per delivery attempt.
    async fn has_listener(&self) -> bool;

    async fn invoke(&self, message: &PipeMessage) -> Result<(), DeliveryError>;
}

/// Channel B
#[async_trait]
pub trait BackgroundBroadcast: Send + Sync {
    async fn broadcast(&self, uri: &str) -> Result<(), DeliveryError>;
}

/// Channel C
#[async_trait]
pub trait DeepLinkLauncher: Send + Sync {
    async fn open(&self, uri: &str) -> Result<(), DeliveryError>;
}

/// Starts the background host that owns the service pipe listener
pub trait HostService: Send + Sync {
    /// Request a start and return without waiting for it
    fn request_start(&self) -> Result<(), DeliveryError>;
}

/// Service pipe over a Unix socket, one JSON message per line
pub struct UnixSocketPipe {
    path: PathBuf,
}

impl UnixSocketPipe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ServicePipe for UnixSocketPipe {
    /// Connects and closes without writing; the host sees an empty connection
    async fn has_listener(&self) -> bool {
        UnixStream::connect(&self.path).await.is_ok()
    }

    async fn invoke(&self, message: &PipeMessage) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stream = UnixStream::connect(&self.path).await?;
        stream.write_all(&line).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Runs a program template with `{uri}` substituted
#[derive(Debug, Clone)]
pub struct ProgramChannel {
    argv: Vec<String>,
}

impl ProgramChannel {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn command(&self, uri: &str) -> Result<(String, Command), DeliveryError> {
        let (program, args) = self.argv.split_first().ok_or(DeliveryError::NotConfigured)?;
        let mut command = Command::new(program);
        command
            .args(args.iter().map(|a| a.replace(URI_PLACEHOLDER, uri)))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        Ok((program.clone(), command))
    }

    /// Run to completion; a signal-terminated process counts as canceled
    async fn run(&self, uri: &str) -> Result<(), DeliveryError> {
        let (program, mut command) = self.command(uri)?;
        debug!("[RELAY] Running {} for {}", program, uri);
        let status = command
            .status()
            .await
            .map_err(|source| DeliveryError::Spawn {
                program: program.clone(),
                source,
            })?;
        match status.code() {
            Some(0) => Ok(()),
            Some(_) => Err(DeliveryError::Exit { program, status }),
            None => Err(DeliveryError::Canceled),
        }
    }
}

#[async_trait]
impl BackgroundBroadcast for ProgramChannel {
    async fn broadcast(&self, uri: &str) -> Result<(), DeliveryError> {
        self.run(uri).await
    }
}

#[async_trait]
impl DeepLinkLauncher for ProgramChannel {
    async fn open(&self, uri: &str) -> Result<(), DeliveryError> {
        self.run(uri).await
    }
}

impl HostService for ProgramChannel {
    fn request_start(&self) -> Result<(), DeliveryError> {
        let (program, mut command) = self.command("")?;
        let mut child = command.spawn().map_err(|source| DeliveryError::Spawn {
            program: program.clone(),
            source,
        })?;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("[RELAY] {} finished", program),
                Ok(status) => warn!("[RELAY] {} exited with {}", program, status),
                Err(e) => warn!("[RELAY] Waiting for {} failed: {}", program, e),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Order in which the fakes were reached
    pub type Journal = Arc<Mutex<Vec<String>>>;

    pub struct FakePipe {
        pub listener: AtomicBool,
        checks: AtomicUsize,
        pub fail: bool,
        pub delivered: Mutex<Vec<PipeMessage>>,
        journal: Journal,
    }

    impl FakePipe {
        pub fn new(listener: bool, journal: Journal) -> Self {
            Self {
                listener: AtomicBool::new(listener),
                checks: AtomicUsize::new(0),
                fail: false,
                delivered: Mutex::new(Vec::new()),
                journal,
            }
        }

        pub fn attach(&self) {
            self.listener.store(true, Ordering::SeqCst);
        }

        /// How often `has_listener` was asked
        pub fn listener_checks(&self) -> usize {
            self.checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServicePipe for FakePipe {
        async fn has_listener(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.listener.load(Ordering::SeqCst)
        }

        async fn invoke(&self, message: &PipeMessage) -> Result<(), DeliveryError> {
            self.journal.lock().unwrap().push(format!("pipe:{}", message.id));
            if self.fail {
                return Err(DeliveryError::Pipe(io::ErrorKind::BrokenPipe.into()));
            }
            self.delivered.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    /// Broadcast, deep link and host fake in one
    pub struct FakeProgram {
        name: &'static str,
        pub fail: bool,
        journal: Journal,
    }

    impl FakeProgram {
        pub fn new(name: &'static str, fail: bool, journal: Journal) -> Self {
            Self { name, fail, journal }
        }

        fn record(&self, uri: &str) -> Result<(), DeliveryError> {
            self.journal.lock().unwrap().push(format!("{}:{}", self.name, uri));
            if self.fail {
                Err(DeliveryError::Canceled)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BackgroundBroadcast for FakeProgram {
        async fn broadcast(&self, uri: &str) -> Result<(), DeliveryError> {
            self.record(uri)
        }
    }

    #[async_trait]
    impl DeepLinkLauncher for FakeProgram {
        async fn open(&self, uri: &str) -> Result<(), DeliveryError> {
            self.record(uri)
        }
    }

    impl HostService for FakeProgram {
        fn request_start(&self) -> Result<(), DeliveryError> {
            self.record("start")
        }
    }
}
