//! Request queue
//!
//! NAT-PMP responses carry no transaction id, only the opcode. Two concurrent
//! requests with the same opcode could not be told apart from a
//! retransmission, so operations are serialized: at most one
//! [`PendingRequest`] is in flight and the rest wait in FIFO order.

use crate::codec::{Protocol, Request};
use crate::manager::Mapping;
use crate::retry::{RetrySchedule, RetryTimer};
use crate::Result;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Successful outcome delivered to a caller
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Answer to an external address request
    ExternalAddress(Ipv4Addr),
    /// Mapping granted by the gateway
    Mapping(Mapping),
    /// Destroy request acknowledged
    Unmapped,
}

/// Single-fire result channel of a caller-issued operation
pub type ReplySink = oneshot::Sender<Result<Reply>>;

/// Who is waiting for an operation to finish
#[derive(Debug)]
pub enum Origin {
    /// A caller awaiting the result
    Caller(ReplySink),
    /// Renewal or re-grant issued by the mapping manager
    Renewal,
}

/// A not-yet-started operation
#[derive(Debug)]
pub struct Operation {
    /// What to send
    pub request: Request,
    /// Where the result goes
    pub origin: Origin,
}

impl Operation {
    /// Operation whose result goes back to a caller
    pub fn caller(request: Request, sink: ReplySink) -> Self {
        Self {
            request,
            origin: Origin::Caller(sink),
        }
    }

    /// Operation issued on behalf of the mapping manager
    pub fn renewal(request: Request) -> Self {
        Self {
            request,
            origin: Origin::Renewal,
        }
    }

    fn is_renewal_of(&self, protocol: Protocol, private_port: u16) -> bool {
        match (&self.origin, self.request) {
            (
                Origin::Renewal,
                Request::Map {
                    protocol: p,
                    private_port: port,
                    ..
                },
            ) => p == protocol && (private_port == 0 || port == private_port),
            _ => false,
        }
    }
}

/// The one operation currently on the wire
#[derive(Debug)]
pub struct PendingRequest {
    /// Request being retransmitted
    pub request: Request,
    /// Encoded once; retransmissions reuse these exact bytes
    pub datagram: Bytes,
    /// Backoff state
    pub timer: RetryTimer,
    /// Result destination
    pub origin: Origin,
}

impl PendingRequest {
    /// Deliver the result to the caller, if any
    ///
    /// Consumes the request, so a result is delivered at most once.
    pub fn resolve(self, result: Result<Reply>) {
        if let Origin::Caller(sink) = self.origin {
            if sink.send(result).is_err() {
                debug!("Caller dropped before {:?} resolved", self.request);
            }
        }
    }
}

/// FIFO of waiting operations plus the single in-flight request
#[derive(Debug, Default)]
pub struct RequestQueue {
    waiting: VecDeque<Operation>,
    in_flight: Option<PendingRequest>,
    schedule: RetrySchedule,
}

impl RequestQueue {
    /// Create an empty queue using `schedule` for admitted requests
    pub fn new(schedule: RetrySchedule) -> Self {
        Self {
            waiting: VecDeque::new(),
            in_flight: None,
            schedule,
        }
    }

    /// Append an operation behind everything already queued
    pub fn enqueue(&mut self, op: Operation) {
        debug!("Queued {:?} ({} waiting)", op.request, self.waiting.len());
        self.waiting.push_back(op);
    }

    /// Promote the next waiting operation if nothing is in flight
    ///
    /// Returns the datagram the caller must transmit now; the retry timer is
    /// armed as if it was sent at `now`.
    pub fn admit_next(&mut self, now: Instant) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }

        let op = self.waiting.pop_front()?;
        let datagram = op.request.encode();
        debug!("Admitted {:?}", op.request);

        self.in_flight = Some(PendingRequest {
            request: op.request,
            datagram: datagram.clone(),
            timer: self.schedule.arm(now),
            origin: op.origin,
        });

        Some(datagram)
    }

    /// The request currently awaiting a response
    pub fn in_flight(&self) -> Option<&PendingRequest> {
        self.in_flight.as_ref()
    }

    /// Mutable access to the in-flight request's retry timer
    pub fn in_flight_mut(&mut self) -> Option<&mut PendingRequest> {
        self.in_flight.as_mut()
    }

    /// Take the in-flight request out once it has resolved
    ///
    /// The next operation is promoted by the following [`Self::admit_next`].
    pub fn on_resolved(&mut self) -> Option<PendingRequest> {
        self.in_flight.take()
    }

    /// Drop queued renewals for a mapping; port 0 matches every port
    pub fn remove_waiting_renewals(&mut self, protocol: Protocol, private_port: u16) -> usize {
        let before = self.waiting.len();
        self.waiting.retain(|op| !op.is_renewal_of(protocol, private_port));
        before - self.waiting.len()
    }

    /// Number of operations not yet admitted
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether nothing is in flight or waiting
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.waiting.is_empty()
    }

    /// Remove everything, in-flight first, then waiting in FIFO order
    pub fn drain(&mut self) -> Vec<Origin> {
        let mut origins = Vec::with_capacity(self.waiting.len() + 1);
        if let Some(pending) = self.in_flight.take() {
            origins.push(pending.origin);
        }
        origins.extend(self.waiting.drain(..).map(|op| op.origin));
        origins
    }
}
