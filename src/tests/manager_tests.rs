use crate::codec::{Protocol, Request};
use crate::manager::*;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

fn mapping(protocol: Protocol, private_port: u16, public_port: u16, lifetime_secs: u32) -> Mapping {
    Mapping {
        protocol,
        private_port,
        public_port,
        lifetime_secs,
        obtained_at: Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_renewal_scheduled_at_half_granted_lifetime() {
    let mut manager = MappingManager::default();
    let now = Instant::now();

    // Requested 3600s, the gateway only granted 1800s
    let renew_at = manager
        .on_grant(mapping(Protocol::Tcp, 3000, 3000, 1800), 3600, now)
        .expect("Grant should be kept");

    assert_eq!(renew_at - now, Duration::from_secs(900));
    assert_eq!(manager.next_renewal(), Some(renew_at));
    assert_eq!(manager.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_take_due_marks_renewal_in_progress() {
    let mut manager = MappingManager::default();
    let now = Instant::now();
    manager.on_grant(mapping(Protocol::Tcp, 3000, 50000, 1800), 3600, now);

    assert!(manager.take_due(now + Duration::from_secs(899)).is_empty());

    let due = manager.take_due(now + Duration::from_secs(900));
    assert_eq!(
        due,
        vec![Request::Map {
            protocol: Protocol::Tcp,
            private_port: 3000,
            public_port: 50000,
            lifetime_secs: 3600,
        }]
    );
    assert_eq!(manager.next_renewal(), None);
    assert!(manager.take_due(now + Duration::from_secs(2000)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_lifetime_grant_not_kept() {
    let mut manager = MappingManager::default();
    let now = Instant::now();
    manager.on_grant(mapping(Protocol::Udp, 4000, 4000, 60), 60, now);

    assert!(manager.on_grant(mapping(Protocol::Udp, 4000, 0, 0), 60, now).is_none());
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_retries_within_remaining_lifetime() {
    let mut manager = MappingManager::default();
    let granted = Instant::now();
    manager.on_grant(mapping(Protocol::Tcp, 3000, 3000, 1800), 1800, granted);

    let failed_at = granted + Duration::from_secs(900);
    manager.take_due(failed_at);
    manager.on_renewal_failed(Protocol::Tcp, 3000, failed_at);

    // 900s left, retry halfway through them
    assert_eq!(
        manager.next_renewal(),
        Some(granted + Duration::from_secs(1350))
    );
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_near_expiry_drops_mapping() {
    let mut manager = MappingManager::default();
    let granted = Instant::now();
    manager.on_grant(mapping(Protocol::Tcp, 3000, 3000, 10), 10, granted);

    manager.on_renewal_failed(Protocol::Tcp, 3000, granted + Duration::from_secs(9));
    assert!(manager.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_all_returns_regrant_requests() {
    let mut manager = MappingManager::default();
    let now = Instant::now();
    manager.on_grant(mapping(Protocol::Tcp, 3000, 3000, 1800), 3600, now);
    manager.on_grant(mapping(Protocol::Udp, 4000, 40000, 600), 600, now);

    let requests = manager.invalidate_all();
    assert!(manager.is_empty());
    assert_eq!(manager.next_renewal(), None);
    assert_eq!(
        requests,
        vec![
            Request::Map {
                protocol: Protocol::Udp,
                private_port: 4000,
                public_port: 40000,
                lifetime_secs: 600,
            },
            Request::Map {
                protocol: Protocol::Tcp,
                private_port: 3000,
                public_port: 3000,
                lifetime_secs: 3600,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_destroy_and_cancel() {
    let mut manager = MappingManager::default();
    let now = Instant::now();
    manager.on_grant(mapping(Protocol::Tcp, 3000, 3000, 1800), 1800, now);
    manager.on_grant(mapping(Protocol::Tcp, 3001, 3001, 1800), 1800, now);
    manager.on_grant(mapping(Protocol::Udp, 3000, 3000, 1800), 1800, now);

    manager.cancel_renewal(Protocol::Tcp, 3000);
    assert!(manager.get(Protocol::Tcp, 3000).is_some(), "Cancel keeps the mapping");
    assert!(
        manager
            .take_due(now + Duration::from_secs(900))
            .iter()
            .all(|r| !matches!(r, Request::Map { protocol: Protocol::Tcp, private_port: 3000, .. }))
    );

    manager.on_destroyed(Protocol::Tcp, 3000);
    assert!(manager.get(Protocol::Tcp, 3000).is_none());
    assert_eq!(manager.len(), 2);

    // Port 0 removes every mapping of the protocol
    manager.on_destroyed(Protocol::Tcp, 0);
    let remaining = manager.mappings();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].protocol, Protocol::Udp);
}

#[tokio::test(start_paused = true)]
async fn test_resume_renewal_after_cancel() {
    let mut manager = MappingManager::default();
    let now = Instant::now();
    manager.on_grant(mapping(Protocol::Tcp, 3000, 3000, 1800), 1800, now);
    manager.on_grant(mapping(Protocol::Tcp, 3001, 3001, 600), 600, now);

    manager.cancel_renewal(Protocol::Tcp, 0);
    assert_eq!(manager.next_renewal(), None);

    // Original schedule while it is still ahead, immediately once it passed
    let later = now + Duration::from_secs(400);
    manager.resume_renewal(Protocol::Tcp, 0, later);
    assert_eq!(manager.next_renewal(), Some(later));
    assert_eq!(manager.take_due(later).len(), 1);
    assert_eq!(manager.next_renewal(), Some(now + Duration::from_secs(900)));
}

#[test]
fn test_mapping_expiry_and_serialization() {
    let mapping = mapping(Protocol::Udp, 5060, 5060, 120);
    assert_eq!(
        mapping.expires_at() - mapping.obtained_at,
        chrono::Duration::seconds(120)
    );

    let json = serde_json::to_string(&mapping).expect("Failed to serialize");
    let deserialized: Mapping = serde_json::from_str(&json).expect("Failed to deserialize");
    assert_eq!(mapping, deserialized);
}

#[test]
fn test_custom_renewal_fraction() {
    let manager = MappingManager::new(0.8);
    assert_eq!(manager.renewal_delay(100), Duration::from_secs(80));
}
