//! Inbound datagram validation
//!
//! Every datagram received on the client port goes through
//! [`ResponseDispatcher::dispatch`]. UDP has no sender authentication, so
//! anything that fails to decode or does not answer the in-flight request is
//! dropped and logged; it never fails the client.

use crate::codec::{Request, Response, ResponseBody};
use crate::queue::PendingRequest;
use std::net::{SocketAddr, SocketAddrV4};
use tracing::{debug, warn};

/// Last observed gateway uptime, used to detect gateway reboots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayEpoch {
    last: Option<u32>,
}

impl GatewayEpoch {
    /// Most recently recorded seconds-since-start
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Record a new observation; returns `true` if the counter went backwards
    pub fn observe(&mut self, epoch_secs: u32) -> bool {
        let rebooted = matches!(self.last, Some(last) if epoch_secs < last);
        self.last = Some(epoch_secs);
        rebooted
    }
}

/// Why a datagram was not matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Sender is not the gateway's NAT-PMP port
    UnexpectedSender(SocketAddr),
    /// Datagram did not decode
    Malformed(String),
    /// Nothing was awaiting a response
    NoPendingRequest,
    /// Response answers a different request
    Mismatch,
}

/// Outcome of dispatching one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Datagram ignored
    Dropped(DropReason),
    /// Datagram answers the in-flight request
    Matched {
        /// Decoded response
        response: Response,
        /// The gateway's uptime went backwards since the previous response
        rebooted: bool,
    },
}

/// Matches inbound datagrams against the in-flight request
#[derive(Debug)]
pub struct ResponseDispatcher {
    gateway: SocketAddrV4,
    epoch: GatewayEpoch,
}

impl ResponseDispatcher {
    /// Create a dispatcher accepting datagrams from `gateway` only
    pub fn new(gateway: SocketAddrV4) -> Self {
        Self {
            gateway,
            epoch: GatewayEpoch::default(),
        }
    }

    /// Current gateway epoch
    pub fn epoch(&self) -> GatewayEpoch {
        self.epoch
    }

    /// Validate one datagram
    ///
    /// The epoch is updated only for matched responses.
    pub fn dispatch(
        &mut self,
        datagram: &[u8],
        sender: SocketAddr,
        pending: Option<&PendingRequest>,
    ) -> Dispatch {
        let response = match self.classify(datagram, sender, pending) {
            Ok(response) => response,
            Err(DropReason::Malformed(reason)) => {
                warn!("Dropping malformed datagram from {}: {}", sender, reason);
                return Dispatch::Dropped(DropReason::Malformed(reason));
            }
            Err(reason) => {
                debug!("Dropping datagram from {}: {:?}", sender, reason);
                return Dispatch::Dropped(reason);
            }
        };

        let previous = self.epoch.last();
        let rebooted = self.epoch.observe(response.epoch_secs);
        if rebooted {
            warn!(
                "Gateway epoch went backwards ({:?} -> {}), gateway restarted",
                previous, response.epoch_secs
            );
        }
        debug!(
            "Matched {:?} response (result: {}, epoch: {}s)",
            response.opcode, response.result_code, response.epoch_secs
        );

        Dispatch::Matched { response, rebooted }
    }

    fn classify(
        &self,
        datagram: &[u8],
        sender: SocketAddr,
        pending: Option<&PendingRequest>,
    ) -> Result<Response, DropReason> {
        if sender != SocketAddr::V4(self.gateway) {
            return Err(DropReason::UnexpectedSender(sender));
        }

        let response =
            Response::decode(datagram).map_err(|e| DropReason::Malformed(e.to_string()))?;

        let pending = pending.ok_or(DropReason::NoPendingRequest)?;
        if !answers(&pending.request, &response) {
            return Err(DropReason::Mismatch);
        }

        Ok(response)
    }
}

/// Whether `response` is the answer to `request`
pub fn answers(request: &Request, response: &Response) -> bool {
    if request.opcode() != response.opcode {
        return false;
    }

    match (request, response.body) {
        (
            Request::Map { private_port, .. },
            Some(ResponseBody::Map {
                private_port: answered,
                ..
            }),
        ) => *private_port == answered,
        _ => true,
    }
}
