//! Generic UDP service: bind a socket, then receive → dispatch → reply until stopped.

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::ServiceError;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A datagram to send back through the service socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub dest: SocketAddr,
    pub data: Vec<u8>,
}

impl Reply {
    pub fn new(dest: SocketAddr, data: impl Into<Vec<u8>>) -> Self {
        Self {
            dest,
            data: data.into(),
        }
    }
}

/// Protocol engine plugged into a [`UdpService`].
///
/// Datagrams are handed over one at a time, in receipt order.
pub trait DatagramHandler: Send + 'static {
    fn handle(
        &mut self,
        src: SocketAddr,
        data: &[u8],
    ) -> impl Future<Output = Option<Reply>> + Send;

    /// Called on every poll tick.
    fn maintain(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once the socket is closed.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub bind: SocketAddr,
    /// Restrict the socket to one network device (Linux only)
    pub interface: Option<String>,
    pub broadcast: bool,
    pub poll_interval: Duration,
    /// Fixed delay applied before every reply
    pub reply_delay: Option<Duration>,
}

impl ServiceOptions {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            interface: None,
            broadcast: false,
            poll_interval: Duration::from_secs(1),
            reply_delay: None,
        }
    }
}

pub struct UdpService<H> {
    name: String,
    options: ServiceOptions,
    handler: H,
    events: Option<Arc<EventBus>>,
}

impl<H: DatagramHandler> UdpService<H> {
    pub fn new(name: impl Into<String>, options: ServiceOptions, handler: H) -> Self {
        Self {
            name: name.into(),
            options,
            handler,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Bind the socket and spawn the service loop.
    pub async fn start(self) -> Result<ServiceHandle, ServiceError> {
        let (state_tx, state_rx) = watch::channel(ServiceState::Idle);
        let lifecycle = Lifecycle {
            name: self.name.clone(),
            state: state_tx,
            events: self.events,
        };
        lifecycle.enter(ServiceState::Starting);

        let socket = match bind_socket(&self.name, &self.options) {
            Ok(socket) => socket,
            Err(e) => {
                lifecycle.enter(ServiceState::Stopped);
                return Err(e);
            }
        };
        let local_addr = socket.local_addr().map_err(|source| ServiceError::Socket {
            service: self.name.clone(),
            source,
        })?;

        info!("{} listening on {}", self.name, local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        lifecycle.enter(ServiceState::Running);

        let span = info_span!("service", name = %self.name);
        let task = tokio::spawn(
            run_loop(socket, self.handler, self.options, stop_rx, lifecycle).instrument(span),
        );

        Ok(ServiceHandle {
            name: self.name,
            local_addr,
            stop: stop_tx,
            state: state_rx,
            task,
        })
    }
}

struct Lifecycle {
    name: String,
    state: watch::Sender<ServiceState>,
    events: Option<Arc<EventBus>>,
}

impl Lifecycle {
    fn enter(&self, state: ServiceState) {
        debug!("{} -> {:?}", self.name, state);
        self.state.send_replace(state);
        if let Some(events) = &self.events {
            events.service(&self.name, state);
        }
    }
}

fn bind_socket(name: &str, options: &ServiceOptions) -> Result<UdpSocket, ServiceError> {
    let socket_err = |source| ServiceError::Socket {
        service: name.to_string(),
        source,
    };

    let domain = Domain::for_address(options.bind);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(socket_err)?;
    socket.set_reuse_address(true).map_err(socket_err)?;
    if options.broadcast {
        socket.set_broadcast(true).map_err(socket_err)?;
    }

    socket
        .bind(&options.bind.into())
        .map_err(|source| ServiceError::Bind {
            service: name.to_string(),
            addr: options.bind,
            source,
        })?;

    #[cfg(target_os = "linux")]
    if let Some(interface) = &options.interface {
        socket
            .bind_device(Some(interface.as_bytes()))
            .map_err(socket_err)?;
        info!("{} bound to interface {}", name, interface);
    }

    socket.set_nonblocking(true).map_err(socket_err)?;
    UdpSocket::from_std(socket.into()).map_err(socket_err)
}

async fn run_loop<H: DatagramHandler>(
    socket: UdpSocket,
    mut handler: H,
    options: ServiceOptions,
    mut stop: watch::Receiver<bool>,
    lifecycle: Lifecycle,
) {
    let mut buf = vec![0u8; 65536];
    let mut tick = tokio::time::interval(options.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tick.tick() => handler.maintain().await,
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("{} recv error: {}", lifecycle.name, e);
                        continue;
                    }
                };

                let Some(reply) = handler.handle(src, &buf[..len]).await else {
                    continue;
                };

                if let Some(delay) = options.reply_delay {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = socket.send_to(&reply.data, reply.dest).await {
                    warn!("{} failed to send reply to {}: {}", lifecycle.name, reply.dest, e);
                }
            }
        }
    }

    lifecycle.enter(ServiceState::Stopping);
    drop(socket);
    handler.shutdown().await;
    lifecycle.enter(ServiceState::Stopped);
    info!("{} stopped", lifecycle.name);
}

/// Control handle of a running [`UdpService`].
pub struct ServiceHandle {
    name: String,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    state: watch::Receiver<ServiceState>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Ask the loop to stop; it exits at its next wake-up.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Resolves once the service reaches `Stopped` or its task is gone.
    pub async fn stopped(&mut self) {
        let _ = self.state.wait_for(|s| *s == ServiceState::Stopped).await;
    }

    pub async fn join(self) -> Result<(), ServiceError> {
        self.task.await.map_err(|e| ServiceError::Aborted {
            service: self.name,
            reason: e.to_string(),
        })
    }

    pub async fn shutdown(self) -> Result<(), ServiceError> {
        self.stop();
        self.join().await
    }
}
