//! NAT-PMP client facade
//!
//! [`Client`] is a cheap, cloneable handle. All protocol state (request queue,
//! retry timer, gateway epoch, held mappings) is owned by a single background
//! task that sees commands, inbound datagrams and timer expiries one at a
//! time, so no locking is needed around it.
//!
//! ```text
//! Client ──Command──▶ ClientActor ◀──datagrams── reader task ◀── Transport
//!                       │  RequestQueue ─ RetryTimer
//!                       │  ResponseDispatcher ─ GatewayEpoch
//!                       └  MappingManager
//! ```

use crate::codec::{Protocol, Request, Response, ResponseBody, ResultCode};
use crate::config::ClientConfig;
use crate::dispatcher::{Dispatch, ResponseDispatcher};
use crate::gateway::find_default_gateway;
use crate::manager::{Mapping, MappingManager};
use crate::queue::{Operation, Origin, PendingRequest, Reply, RequestQueue};
use crate::retry::RetryAction;
use crate::transport::{Transport, bind_udp};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::Utc;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

/// Largest datagram read from the socket; anything longer is malformed anyway
const RECV_BUFFER_LEN: usize = 1100;

/// Lifecycle of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Socket not bound yet; [`Client::bind`] has not returned
    Unbound,
    /// Socket ready, requests are admitted
    Bound,
    /// Terminal; every operation fails with [`Error::Closed`]
    Closed,
}

enum Command {
    Submit(Operation),
    Mappings(oneshot::Sender<Vec<Mapping>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a running NAT-PMP client
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
    gateway: SocketAddrV4,
}

impl Client {
    /// Bind the client UDP socket and start the client
    ///
    /// The gateway is discovered from the routing table if not configured.
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let gateway = resolve_gateway(&config)?;
        let socket = bind_udp(config.client_port).await?;
        Ok(Self::start(&config, gateway, socket))
    }

    /// Start a client over an already bound transport
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport<T: Transport>(config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let gateway = resolve_gateway(&config)?;
        Ok(Self::start(&config, gateway, transport))
    }

    fn start<T: Transport>(config: &ClientConfig, gateway: Ipv4Addr, transport: T) -> Self {
        let gateway = SocketAddrV4::new(gateway, config.server_port);
        let transport = Arc::new(transport);

        // The transport is bound by the time a handle exists
        let (state_tx, state_rx) = watch::channel(ClientState::Bound);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_datagrams(transport.clone(), inbound_tx));

        let actor = ClientActor {
            transport,
            gateway,
            queue: RequestQueue::new(config.retry_schedule()),
            dispatcher: ResponseDispatcher::new(gateway),
            mappings: MappingManager::new(config.renewal_fraction),
            commands: command_rx,
            inbound: inbound_rx,
            reader,
            state: state_tx,
        };
        info!("NAT-PMP client started for gateway {}", gateway);
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            state: state_rx,
            gateway,
        }
    }

    /// Gateway address requests are sent to
    pub fn gateway(&self) -> SocketAddrV4 {
        self.gateway
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Ask the gateway for its external IPv4 address
    pub async fn get_external_ip(&self) -> Result<Ipv4Addr> {
        match self.submit(Request::ExternalAddress).await? {
            Reply::ExternalAddress(ip) => Ok(ip),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Request a port mapping
    ///
    /// `public_port` is only a suggestion (0 lets the gateway choose); the
    /// returned [`Mapping`] carries what the gateway actually granted. The
    /// mapping is renewed automatically until it is unmapped or the client
    /// is closed.
    pub async fn map_port(
        &self,
        protocol: Protocol,
        private_port: u16,
        public_port: u16,
        lifetime_secs: u32,
    ) -> Result<Mapping> {
        if private_port == 0 {
            return Err(Error::InvalidArgument(
                "private port must be non-zero".to_string(),
            ));
        }
        if lifetime_secs == 0 {
            return Err(Error::InvalidArgument(
                "lifetime must be non-zero, use unmap_port to destroy a mapping".to_string(),
            ));
        }

        let request = Request::Map {
            protocol,
            private_port,
            public_port,
            lifetime_secs,
        };
        match self.submit(request).await? {
            Reply::Mapping(mapping) => Ok(mapping),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Destroy a mapping; private port 0 destroys every mapping of `protocol`
    pub async fn unmap_port(&self, protocol: Protocol, private_port: u16) -> Result<()> {
        let request = Request::Map {
            protocol,
            private_port,
            public_port: 0,
            lifetime_secs: 0,
        };
        match self.submit(request).await? {
            Reply::Unmapped => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Snapshot of the mappings currently held
    pub async fn mappings(&self) -> Result<Vec<Mapping>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Mappings(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Shut the client down
    ///
    /// Cancels all timers, fails every queued or in-flight operation with
    /// [`Error::Closed`] and releases the socket. Mappings are not destroyed
    /// on the gateway; they lapse when their lifetime runs out.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn submit(&self, request: Request) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit(Operation::caller(request, tx)))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.state() == ClientState::Closed {
            return Err(Error::Closed);
        }
        self.commands.send(command).map_err(|_| Error::Closed)
    }
}

fn resolve_gateway(config: &ClientConfig) -> Result<Ipv4Addr> {
    match config.gateway {
        Some(gateway) => Ok(gateway),
        None => find_default_gateway(),
    }
}

fn unexpected_reply(reply: Reply) -> Error {
    Error::MalformedMessage(format!("Unexpected reply: {:?}", reply))
}

/// Forward every inbound datagram to the actor until it goes away
async fn read_datagrams<T: Transport>(
    transport: Arc<T>,
    inbound: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        match transport.recv_from(&mut buf).await {
            Ok((len, sender)) => {
                if inbound
                    .send((Bytes::copy_from_slice(&buf[..len]), sender))
                    .is_err()
                {
                    break;
                }
            }
            // ICMP port unreachable surfaces here on some platforms
            Err(e) => warn!("Failed to receive datagram: {}", e),
        }
    }
}

/// Single owner of all protocol state
struct ClientActor<T: Transport> {
    transport: Arc<T>,
    gateway: SocketAddrV4,
    queue: RequestQueue,
    dispatcher: ResponseDispatcher,
    mappings: MappingManager,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    reader: JoinHandle<()>,
    state: watch::Sender<ClientState>,
}

impl<T: Transport> ClientActor<T> {
    async fn run(mut self) {
        loop {
            let retry_at = self.queue.in_flight().map(|p| p.timer.fire_at());
            let renew_at = self.mappings.next_renewal();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(op)) => self.submit(op).await,
                    Some(Command::Mappings(reply)) => {
                        let _ = reply.send(self.mappings.mappings());
                    }
                    Some(Command::Close(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        debug!("All client handles dropped");
                        self.shutdown();
                        return;
                    }
                },
                Some((datagram, sender)) = self.inbound.recv() => {
                    self.on_datagram(&datagram, sender).await;
                }
                _ = sleep_until_some(retry_at) => self.on_retry_timer().await,
                _ = sleep_until_some(renew_at) => self.on_renewal_due().await,
            }
        }
    }

    async fn submit(&mut self, op: Operation) {
        if let Request::Map {
            protocol,
            private_port,
            lifetime_secs: 0,
            ..
        } = op.request
        {
            self.mappings.cancel_renewal(protocol, private_port);
            let dropped = self.queue.remove_waiting_renewals(protocol, private_port);
            if dropped > 0 {
                debug!("Dropped {} queued renewal(s) superseded by destroy", dropped);
            }
        }

        self.queue.enqueue(op);
        self.pump().await;
    }

    /// Transmit the next queued request if nothing is in flight
    async fn pump(&mut self) {
        while let Some(datagram) = self.queue.admit_next(Instant::now()) {
            match self.transport.send_to(&datagram, self.gateway).await {
                Ok(()) => {
                    debug!("Sent {} byte request to {}", datagram.len(), self.gateway);
                    return;
                }
                Err(e) => {
                    error!("Failed to send request to {}: {}", self.gateway, e);
                    if let Some(pending) = self.queue.on_resolved() {
                        self.finish(pending, Err(Error::Io(e)));
                    }
                }
            }
        }
    }

    async fn on_retry_timer(&mut self) {
        let Some(pending) = self.queue.in_flight_mut() else {
            return;
        };

        match pending.timer.on_fire() {
            RetryAction::Retransmit(attempt) => {
                let datagram = pending.datagram.clone();
                debug!(
                    "Retransmitting {:?} (attempt {}, next wait {:?})",
                    pending.request,
                    attempt,
                    pending.timer.next_delay()
                );
                if let Err(e) = self.transport.send_to(&datagram, self.gateway).await {
                    error!("Failed to retransmit request to {}: {}", self.gateway, e);
                    if let Some(pending) = self.queue.on_resolved() {
                        self.finish(pending, Err(Error::Io(e)));
                    }
                    self.pump().await;
                }
            }
            RetryAction::GiveUp => {
                warn!(
                    "No response to {:?} after {} transmissions",
                    pending.request,
                    pending.timer.attempt()
                );
                if let Some(pending) = self.queue.on_resolved() {
                    self.finish(pending, Err(Error::Timeout));
                }
                self.pump().await;
            }
        }
    }

    async fn on_renewal_due(&mut self) {
        for request in self.mappings.take_due(Instant::now()) {
            self.queue.enqueue(Operation::renewal(request));
        }
        self.pump().await;
    }

    async fn on_datagram(&mut self, datagram: &[u8], sender: SocketAddr) {
        let dispatch = self
            .dispatcher
            .dispatch(datagram, sender, self.queue.in_flight());
        let Dispatch::Matched { response, rebooted } = dispatch else {
            return;
        };

        let Some(pending) = self.queue.on_resolved() else {
            return;
        };

        if rebooted {
            self.regrant_after_reboot(&pending.request, &response);
        }

        let result = self.interpret(&pending.request, &response);
        self.finish(pending, result);
        self.pump().await;
    }

    /// Re-request every held mapping the answered request does not settle
    ///
    /// A successful grant re-creates its own mapping and a destroy removes
    /// it; a failed grant leaves it lost on the gateway like the rest.
    fn regrant_after_reboot(&mut self, answered: &Request, response: &Response) {
        let settled = match *answered {
            Request::Map {
                lifetime_secs: 0, ..
            } => true,
            Request::Map { .. } => response.result_code == ResultCode::Success,
            Request::ExternalAddress => false,
        };

        for request in self.mappings.invalidate_all() {
            let Request::Map {
                protocol,
                private_port,
                ..
            } = request
            else {
                continue;
            };
            if settled && covers(answered, protocol, private_port) {
                continue;
            }

            // A renewal queued before the reboot was noticed is superseded
            self.queue.remove_waiting_renewals(protocol, private_port);
            info!("Re-requesting {:?} after gateway restart", request);
            self.queue.enqueue(Operation::renewal(request));
        }
    }

    /// Turn a matched response into the caller-visible result
    fn interpret(&mut self, request: &Request, response: &Response) -> Result<Reply> {
        if response.result_code != ResultCode::Success {
            warn!("Gateway rejected {:?}: {}", request, response.result_code);
            return Err(Error::Protocol(response.result_code));
        }

        match (*request, response.body) {
            (Request::ExternalAddress, Some(ResponseBody::ExternalAddress(ip))) => {
                info!("External IP address: {}", ip);
                Ok(Reply::ExternalAddress(ip))
            }
            (
                Request::Map {
                    protocol,
                    private_port,
                    lifetime_secs: 0,
                    ..
                },
                Some(ResponseBody::Map { .. }),
            ) => {
                self.mappings.on_destroyed(protocol, private_port);
                Ok(Reply::Unmapped)
            }
            (
                Request::Map {
                    protocol,
                    lifetime_secs: requested,
                    ..
                },
                Some(ResponseBody::Map {
                    private_port,
                    public_port,
                    lifetime_secs,
                }),
            ) => {
                let mapping = Mapping {
                    protocol,
                    private_port,
                    public_port,
                    lifetime_secs,
                    obtained_at: Utc::now(),
                };
                self.mappings
                    .on_grant(mapping.clone(), requested, Instant::now());
                Ok(Reply::Mapping(mapping))
            }
            (request, body) => Err(Error::MalformedMessage(format!(
                "Response body {:?} does not answer {:?}",
                body, request
            ))),
        }
    }

    /// Deliver a result and let the mapping manager see failed map requests
    fn finish(&mut self, pending: PendingRequest, result: Result<Reply>) {
        if let (
            Request::Map {
                protocol,
                private_port,
                lifetime_secs,
                ..
            },
            Err(e),
        ) = (pending.request, &result)
        {
            if lifetime_secs == 0 {
                warn!("Destroying {} {} failed: {}", protocol, private_port, e);
                self.mappings
                    .resume_renewal(protocol, private_port, Instant::now());
            } else if matches!(pending.origin, Origin::Renewal) {
                warn!("Renewal of {} {} failed: {}", protocol, private_port, e);
                self.mappings
                    .on_renewal_failed(protocol, private_port, Instant::now());
            }
        }
        pending.resolve(result);
    }

    fn shutdown(&mut self) {
        let origins = self.queue.drain();
        let failed = origins
            .into_iter()
            .filter_map(|origin| match origin {
                Origin::Caller(sink) => Some(sink),
                Origin::Renewal => None,
            })
            .map(|sink| sink.send(Err(Error::Closed)))
            .count();

        self.mappings.clear();
        self.reader.abort();
        self.state.send_replace(ClientState::Closed);
        info!(
            "NAT-PMP client for {} closed ({} pending operation(s) failed)",
            self.gateway, failed
        );
    }
}

/// Whether `request` concerns the mapping keyed by (protocol, private port)
fn covers(request: &Request, protocol: Protocol, private_port: u16) -> bool {
    match *request {
        Request::Map {
            protocol: p,
            private_port: port,
            ..
        } => p == protocol && (port == 0 || port == private_port),
        Request::ExternalAddress => false,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("gateway", &self.gateway)
            .field("state", &self.state())
            .finish()
    }
}
