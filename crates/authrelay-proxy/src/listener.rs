//! TCP listener with an accept loop task.

use crate::config::ListenerSettings;
use crate::error::{Error, Result};
use crate::task::{Component, StopTimeout, TaskHandle};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, trace, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Receives the sockets accepted by a [`Listener`].
pub trait ConnectionAcceptor: Send + Sync {
    fn on_accept(&self, stream: TcpStream, peer: SocketAddr);
}

#[derive(Debug)]
struct ListenerState {
    settings: ListenerSettings,
    /// Set while bound.
    local_addr: Option<SocketAddr>,
    task: Option<TaskHandle>,
    disposed: bool,
}

pub struct Listener {
    state: Mutex<ListenerState>,
    acceptor: Weak<dyn ConnectionAcceptor>,
}

impl Listener {
    pub fn new(settings: ListenerSettings, acceptor: Weak<dyn ConnectionAcceptor>) -> Self {
        Self {
            state: Mutex::new(ListenerState {
                settings,
                local_addr: None,
                task: None,
                disposed: false,
            }),
            acceptor,
        }
    }

    pub fn settings(&self) -> ListenerSettings {
        self.state.lock().settings
    }

    /// The bound address, `None` unless listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    pub fn is_listening(&self) -> bool {
        let state = self.state.lock();
        state.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) -> Result<()> {
        let mut state = self.state.lock();
        ensure_unbound(&state)?;
        state.settings.endpoint = endpoint;
        Ok(())
    }

    pub fn set_backlog(&self, backlog: u32) -> Result<()> {
        let mut state = self.state.lock();
        ensure_unbound(&state)?;
        state.settings.backlog = backlog;
        Ok(())
    }

    /// Bind and start accepting. Does nothing if already listening.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(Error::Disposed);
        }
        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        // Binding does not block; the socket is non-blocking from the start.
        let settings = state.settings;
        let listener = create_listener(settings.endpoint, settings.backlog).map_err(|e| {
            error!(endpoint = %settings.endpoint, "Failed to bind listener: {}", e);
            Error::Io(e)
        })?;
        let local_addr = listener.local_addr()?;

        let component = Component::new(
            format!("listener {local_addr}"),
            info_span!("listener", endpoint = %local_addr),
        );
        let acceptor = self.acceptor.clone();
        let task = component.spawn(move |_| accept_loop(listener, acceptor));

        state.local_addr = Some(local_addr);
        state.task = Some(task);
        info!(endpoint = %local_addr, backlog = settings.backlog, "Listener started");
        Ok(())
    }

    /// Unbind and request the accept loop to end, without waiting.
    ///
    /// Returns the accept task to wait on, or `None` if not listening.
    pub fn begin_stop(&self) -> Option<TaskHandle> {
        let task = {
            let mut state = self.state.lock();
            state.local_addr = None;
            state.task.take()
        }?;
        task.stop();
        Some(task)
    }

    /// Stop listening. Returns whether the accept loop ended within `timeout`.
    pub async fn stop(&self, timeout: StopTimeout) -> bool {
        match self.begin_stop() {
            Some(task) => task.wait(timeout).await,
            None => true,
        }
    }

    /// Release the listener for good. It must be stopped first.
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock();
        ensure_unbound(&state)?;
        state.disposed = true;
        Ok(())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

fn ensure_unbound(state: &ListenerState) -> Result<()> {
    if state.task.is_some() {
        let endpoint = state
            .local_addr
            .unwrap_or(state.settings.endpoint)
            .to_string();
        return Err(Error::ListenerRunning(endpoint));
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, acceptor: Weak<dyn ConnectionAcceptor>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(acceptor) = acceptor.upgrade() else {
                    debug!("Acceptor is gone, accept loop ends");
                    break;
                };
                trace!(%peer, "Accepted connection");
                acceptor.on_accept(stream, peer);
            }
            Err(e) if is_fatal(&e) => {
                error!("Accept failed, listener stops: {}", e);
                break;
            }
            Err(e) => {
                // Typically EMFILE or a connection reset before accept.
                warn!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected
    )
}

/// Create a non-blocking TCP listener with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
