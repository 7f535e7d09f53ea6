//! In-memory tunnel provider for tests. Every dial lands on a local echo
//! listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::{DialError, DialStream, Dialer, TunnelProvider};
use crate::config::types::SshConfig;
use crate::ssh::SshError;

/// Spawn a listener that echoes every byte back
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

pub(crate) struct FakeDialer {
    echo: Option<SocketAddr>,
    open: AtomicBool,
    dialed: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub(crate) async fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: Some(spawn_echo_server().await),
            open: AtomicBool::new(true),
            dialed: Mutex::new(Vec::new()),
        })
    }

    /// Dialer whose dials always fail
    pub(crate) fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            echo: None,
            open: AtomicBool::new(true),
            dialed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, addr: &str, cancel: &CancellationToken) -> Result<DialStream, DialError> {
        if !self.is_open() {
            return Err(DialError::SessionClosed("fake".into()));
        }
        super::parse_dial_addr(addr)?;
        self.dialed.lock().push(addr.to_string());

        let echo = self
            .echo
            .ok_or_else(|| DialError::Channel("connect refused".into()))?;
        tokio::select! {
            _ = cancel.cancelled() => Err(DialError::Cancelled),
            stream = TcpStream::connect(echo) => {
                let stream: DialStream = Box::pin(stream?);
                Ok(stream)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Provider that hands out echo dialers and remembers them
#[derive(Default)]
pub(crate) struct FakeProvider {
    dialers: Mutex<Vec<Arc<FakeDialer>>>,
}

impl FakeProvider {
    /// SSH host this provider refuses to reach
    pub(crate) const UNREACHABLE_HOST: &'static str = "unreachable.invalid";

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.dialers.lock().len()
    }

    pub(crate) fn dialers(&self) -> Vec<Arc<FakeDialer>> {
        self.dialers.lock().clone()
    }
}

#[async_trait]
impl TunnelProvider for FakeProvider {
    async fn connect(
        &self,
        ssh: &SshConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Dialer>, SshError> {
        if cancel.is_cancelled() {
            return Err(SshError::Cancelled);
        }
        if ssh.host == Self::UNREACHABLE_HOST {
            return Err(SshError::ConnectionFailed(format!(
                "{}:{} unreachable",
                ssh.host, ssh.port
            )));
        }
        let dialer = FakeDialer::echo().await;
        self.dialers.lock().push(dialer.clone());
        let dialer: Arc<dyn Dialer> = dialer;
        Ok(dialer)
    }
}
