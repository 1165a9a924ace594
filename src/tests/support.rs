//! In-memory gateway for driving a `Client` in tests

use crate::codec::{Opcode, Protocol, Request, Response, ResponseBody, ResultCode, SERVER_PORT};
use crate::transport::Transport;
use crate::{Client, ClientConfig};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

pub(crate) const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

pub(crate) fn gateway_addr() -> SocketAddrV4 {
    SocketAddrV4::new(GATEWAY_IP, SERVER_PORT)
}

type Datagram = (Vec<u8>, SocketAddr);

/// `Transport` backed by channels instead of a socket
pub(crate) struct MockTransport {
    sent: mpsc::UnboundedSender<(Vec<u8>, SocketAddrV4)>,
    inbound: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    fail_sends: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn send_to(
        &self,
        datagram: &[u8],
        target: SocketAddrV4,
    ) -> impl Future<Output = io::Result<()>> + Send {
        let result = if self.fail_sends.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "network down"))
        } else {
            self.sent
                .send((datagram.to_vec(), target))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gateway gone"))
        };
        async move { result }
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        async move {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some((data, from)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), from))
                }
                None => std::future::pending().await,
            }
        }
    }
}

/// Test side of the mock: sees what the client sent and answers it
pub(crate) struct MockGateway {
    pub(crate) sent: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddrV4)>,
    inbound: mpsc::UnboundedSender<Datagram>,
    fail_sends: Arc<AtomicBool>,
}

impl MockGateway {
    /// Wait for the next datagram the client sends and decode it
    pub(crate) async fn next_request(&mut self) -> Request {
        let (datagram, target) = self
            .sent
            .recv()
            .await
            .expect("Client stopped sending");
        assert_eq!(target, gateway_addr(), "Requests must go to the gateway");
        Request::decode(&datagram).expect("Client sent an invalid request")
    }

    /// Fail if the client has sent something not yet consumed
    pub(crate) fn assert_nothing_sent(&mut self) {
        if let Ok((datagram, _)) = self.sent.try_recv() {
            panic!("Unexpected request: {:?}", Request::decode(&datagram));
        }
    }

    /// Deliver a response from the gateway's NAT-PMP port
    pub(crate) fn reply(&self, response: Response) {
        self.inject(&response.encode(), SocketAddr::V4(gateway_addr()));
    }

    /// Deliver arbitrary bytes from an arbitrary sender
    pub(crate) fn inject(&self, datagram: &[u8], from: SocketAddr) {
        // The reader is gone once the client is closed
        let _ = self.inbound.send((datagram.to_vec(), from));
    }

    /// Make every following send fail
    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

/// Client wired to a fresh mock gateway
pub(crate) fn start_client() -> (Client, MockGateway) {
    start_client_with(ClientConfig::with_gateway(GATEWAY_IP))
}

pub(crate) fn start_client_with(config: ClientConfig) -> (Client, MockGateway) {
    let (transport, gateway) = mock_transport();
    let client = Client::with_transport(config, transport).expect("Failed to start client");
    (client, gateway)
}

/// Unconnected transport and its gateway side
pub(crate) fn mock_transport() -> (MockTransport, MockGateway) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let fail_sends = Arc::new(AtomicBool::new(false));

    let transport = MockTransport {
        sent: sent_tx,
        inbound: Mutex::new(inbound_rx),
        fail_sends: fail_sends.clone(),
    };
    let gateway = MockGateway {
        sent: sent_rx,
        inbound: inbound_tx,
        fail_sends,
    };
    (transport, gateway)
}

pub(crate) fn external_address_response(ip: Ipv4Addr, epoch_secs: u32) -> Response {
    Response {
        opcode: Opcode::ExternalAddress,
        result_code: ResultCode::Success,
        epoch_secs,
        body: Some(ResponseBody::ExternalAddress(ip)),
    }
}

pub(crate) fn map_response(
    protocol: Protocol,
    private_port: u16,
    public_port: u16,
    lifetime_secs: u32,
    epoch_secs: u32,
) -> Response {
    Response {
        opcode: Opcode::for_protocol(protocol),
        result_code: ResultCode::Success,
        epoch_secs,
        body: Some(ResponseBody::Map {
            private_port,
            public_port,
            lifetime_secs,
        }),
    }
}

/// Header-only error response
pub(crate) fn error_response(opcode: Opcode, code: u16, epoch_secs: u32) -> Response {
    Response {
        opcode,
        result_code: ResultCode::from_u16(code),
        epoch_secs,
        body: None,
    }
}

/// Assert a paused-clock duration to millisecond precision
pub(crate) fn assert_elapsed(actual: Duration, expected_ms: u64) {
    let actual_ms = actual.as_millis() as i128;
    assert!(
        (actual_ms - expected_ms as i128).abs() <= 1,
        "expected ~{}ms, got {:?}",
        expected_ms,
        actual
    );
}
