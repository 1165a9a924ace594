//! Mapping lifecycle and renewal
//!
//! Granted mappings are kept keyed by (protocol, private port). Each one is
//! renewed by re-issuing its mapping request once `renewal_fraction` of the
//! granted lifetime has elapsed (halfway by default). A gateway reboot wipes
//! the gateway's table, so every held mapping is dropped and re-requested.

use crate::codec::{Protocol, Request};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default fraction of the lifetime after which a mapping is renewed
pub const DEFAULT_RENEWAL_FRACTION: f64 = 0.5;

/// Below this remaining lifetime a failed renewal is not retried
const MIN_RENEWAL_WINDOW: Duration = Duration::from_secs(2);

/// A port mapping granted by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mapping {
    /// TCP or UDP
    pub protocol: Protocol,
    /// Port on this host
    pub private_port: u16,
    /// External port assigned by the gateway
    pub public_port: u16,
    /// Granted lifetime in seconds
    pub lifetime_secs: u32,
    /// When the grant was received
    pub obtained_at: DateTime<Utc>,
}

impl Mapping {
    /// When the gateway will drop the mapping unless renewed
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.obtained_at + chrono::Duration::seconds(i64::from(self.lifetime_secs))
    }
}

#[derive(Debug)]
struct Entry {
    mapping: Mapping,
    requested_lifetime_secs: u32,
    granted_at: Instant,
    /// `None` while a renewal is queued or in flight
    renew_at: Option<Instant>,
}

impl Entry {
    fn expires_at(&self) -> Instant {
        self.granted_at + Duration::from_secs(u64::from(self.mapping.lifetime_secs))
    }

    fn renewal_request(&self) -> Request {
        Request::Map {
            protocol: self.mapping.protocol,
            private_port: self.mapping.private_port,
            public_port: self.mapping.public_port,
            lifetime_secs: self.requested_lifetime_secs,
        }
    }
}

/// Tracks held mappings and their renewal deadlines
#[derive(Debug)]
pub struct MappingManager {
    entries: HashMap<(Protocol, u16), Entry>,
    renewal_fraction: f64,
}

impl Default for MappingManager {
    fn default() -> Self {
        Self::new(DEFAULT_RENEWAL_FRACTION)
    }
}

impl MappingManager {
    /// Create an empty manager renewing after `renewal_fraction` of the lifetime
    pub fn new(renewal_fraction: f64) -> Self {
        Self {
            entries: HashMap::new(),
            renewal_fraction,
        }
    }

    /// Delay from grant to renewal for a granted lifetime
    pub fn renewal_delay(&self, lifetime_secs: u32) -> Duration {
        Duration::from_secs_f64(f64::from(lifetime_secs) * self.renewal_fraction)
    }

    /// Record a grant and schedule its renewal
    ///
    /// A grant with zero lifetime is not kept. Returns the renewal time.
    pub fn on_grant(
        &mut self,
        mapping: Mapping,
        requested_lifetime_secs: u32,
        now: Instant,
    ) -> Option<Instant> {
        let key = (mapping.protocol, mapping.private_port);
        if mapping.lifetime_secs == 0 {
            self.entries.remove(&key);
            return None;
        }

        let renew_at = now + self.renewal_delay(mapping.lifetime_secs);
        info!(
            "Mapping {} {} -> {} granted for {}s, renewing in {:?}",
            mapping.protocol,
            mapping.private_port,
            mapping.public_port,
            mapping.lifetime_secs,
            renew_at - now
        );

        self.entries.insert(
            key,
            Entry {
                mapping,
                requested_lifetime_secs,
                granted_at: now,
                renew_at: Some(renew_at),
            },
        );
        Some(renew_at)
    }

    /// Earliest pending renewal deadline
    pub fn next_renewal(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.renew_at).min()
    }

    /// Renewal requests due at `now`; each is marked as in progress
    pub fn take_due(&mut self, now: Instant) -> Vec<Request> {
        let mut due: Vec<Request> = self
            .entries
            .values_mut()
            .filter(|e| e.renew_at.is_some_and(|at| at <= now))
            .map(|e| {
                e.renew_at = None;
                e.renewal_request()
            })
            .collect();
        due.sort_by_key(request_key);

        for request in &due {
            debug!("Renewal due: {:?}", request);
        }
        due
    }

    /// A renewal failed; retry halfway through what is left of the lifetime
    pub fn on_renewal_failed(&mut self, protocol: Protocol, private_port: u16, now: Instant) {
        let key = (protocol, private_port);
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };

        let remaining = entry.expires_at().saturating_duration_since(now);
        if remaining < MIN_RENEWAL_WINDOW {
            warn!(
                "Mapping {} {} expired after failed renewals, dropping it",
                protocol, private_port
            );
            self.entries.remove(&key);
            return;
        }

        let retry_in = remaining / 2;
        warn!(
            "Renewal of {} {} failed, retrying in {:?}",
            protocol, private_port, retry_in
        );
        entry.renew_at = Some(now + retry_in);
    }

    /// Stop renewing a mapping about to be destroyed; port 0 matches all ports
    pub fn cancel_renewal(&mut self, protocol: Protocol, private_port: u16) {
        for (key, entry) in self.entries.iter_mut() {
            if matches_key(*key, protocol, private_port) {
                entry.renew_at = None;
            }
        }
    }

    /// Reschedule renewals stopped by [`cancel_renewal`](Self::cancel_renewal)
    ///
    /// Used when the gateway refused or never answered the destroy. A renewal
    /// whose original time has already passed is due immediately.
    pub fn resume_renewal(&mut self, protocol: Protocol, private_port: u16, now: Instant) {
        let renewal_fraction = self.renewal_fraction;
        for (key, entry) in self.entries.iter_mut() {
            if !matches_key(*key, protocol, private_port) || entry.renew_at.is_some() {
                continue;
            }
            let delay = Duration::from_secs_f64(
                f64::from(entry.mapping.lifetime_secs) * renewal_fraction,
            );
            let renew_at = (entry.granted_at + delay).max(now);
            debug!(
                "Resuming renewal of {} {} at {:?}",
                key.0,
                key.1,
                renew_at - now
            );
            entry.renew_at = Some(renew_at);
        }
    }

    /// Forget a destroyed mapping; port 0 forgets every mapping of `protocol`
    pub fn on_destroyed(&mut self, protocol: Protocol, private_port: u16) {
        self.entries
            .retain(|key, _| !matches_key(*key, protocol, private_port));
        info!("Mapping {} {} destroyed", protocol, private_port);
    }

    /// Drop every mapping after a gateway reboot, returning re-grant requests
    pub fn invalidate_all(&mut self) -> Vec<Request> {
        let mut requests: Vec<Request> = self
            .entries
            .drain()
            .map(|(_, entry)| entry.renewal_request())
            .collect();
        requests.sort_by_key(request_key);

        if !requests.is_empty() {
            warn!(
                "Gateway lost its mapping table, re-requesting {} mapping(s)",
                requests.len()
            );
        }
        requests
    }

    /// Held mapping for a key
    pub fn get(&self, protocol: Protocol, private_port: u16) -> Option<&Mapping> {
        self.entries
            .get(&(protocol, private_port))
            .map(|e| &e.mapping)
    }

    /// Snapshot of held mappings, ordered by protocol then private port
    pub fn mappings(&self) -> Vec<Mapping> {
        let mut mappings: Vec<Mapping> =
            self.entries.values().map(|e| e.mapping.clone()).collect();
        mappings.sort_by_key(|m| (m.protocol, m.private_port));
        mappings
    }

    /// Number of held mappings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no mapping is held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything without notifying the gateway
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Port 0 matches every port of `protocol`
fn matches_key(key: (Protocol, u16), protocol: Protocol, private_port: u16) -> bool {
    key.0 == protocol && (private_port == 0 || key.1 == private_port)
}

fn request_key(request: &Request) -> (Option<Protocol>, u16) {
    match request {
        Request::ExternalAddress => (None, 0),
        Request::Map {
            protocol,
            private_port,
            ..
        } => (Some(*protocol), *private_port),
    }
}
