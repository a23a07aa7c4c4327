//! Link lifecycle and admission control (§4.4 "Connection tracker").
//!
//! Tracks every BLE link this node knows about — whether discovered via
//! scanning (we would connect as central) or connected to us (we are the
//! peripheral) — through discovery, connection attempts, backoff, and
//! teardown. The BLE engine consults this before starting a new connection
//! attempt and reports every state transition back into it; nothing here
//! talks to the BLE stack directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::PowerProfile;

/// Base of the exponential reconnect backoff (§4.4).
pub const BACKOFF_BASE: Duration = Duration::from_secs(3);
/// Ceiling the backoff never exceeds, however many attempts accumulate.
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Minimum gap between connection attempts toward the same address (§4.4):
/// two scan results for the same device arriving within this window must
/// not both be allowed to start a connect.
pub const MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(5);

/// Which GATT role this node plays on a given link. A single remote device
/// can appear in both roles simultaneously (we connect to it as central
/// while it also connects to us as peripheral); they are tracked as
/// separate links and deduplicated at the packet layer, not here (§4.4,
/// §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub device_id: u64,
    pub role: LinkRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Discovered,
    Connecting,
    Connected,
    /// Central role only: notifications enabled and the link is usable for
    /// send/receive.
    Subscribed,
    Disconnected,
}

#[derive(Debug, Clone)]
struct Link {
    state: LinkState,
    rssi: i16,
    last_seen: Instant,
    connect_attempts: u32,
    backoff_until: Option<Instant>,
    last_attempt_at: Option<Instant>,
}

impl Link {
    fn new(rssi: i16) -> Self {
        Self {
            state: LinkState::Discovered,
            rssi,
            last_seen: Instant::now(),
            connect_attempts: 0,
            backoff_until: None,
            last_attempt_at: None,
        }
    }

    fn backoff_for_attempt(attempts: u32) -> Duration {
        let exp = attempts.min(6);
        (BACKOFF_BASE * 2u32.saturating_pow(exp)).min(BACKOFF_CAP)
    }
}

/// Tracks every known link (by device + role) through its lifecycle and
/// applies admission control for new connection attempts (§4.4).
pub struct ConnectionTracker {
    links: DashMap<LinkId, Link>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self { links: DashMap::new() }
    }

    /// Record (or refresh) a scan sighting of a peripheral-role candidate.
    pub fn register_scan_result(&self, device_id: u64, rssi: i16) {
        let id = LinkId {
            device_id,
            role: LinkRole::Central,
        };
        self.links
            .entry(id)
            .and_modify(|link| {
                link.rssi = rssi;
                link.last_seen = Instant::now();
            })
            .or_insert_with(|| Link::new(rssi));
    }

    /// Whether a new central-role connection attempt toward `device_id` is
    /// currently allowed: true iff there is no active connection record for
    /// the address, no attempt in the last [`MIN_ATTEMPT_INTERVAL`], and the
    /// profile's concurrent-connection cap isn't already met (§4.4, §10
    /// `PowerProfile`).
    pub fn is_connect_allowed(&self, device_id: u64, profile: PowerProfile) -> bool {
        let id = LinkId {
            device_id,
            role: LinkRole::Central,
        };
        if let Some(link) = self.links.get(&id) {
            if matches!(link.state, LinkState::Connecting | LinkState::Connected | LinkState::Subscribed) {
                return false;
            }
            if let Some(until) = link.backoff_until {
                if Instant::now() < until {
                    return false;
                }
            }
            if let Some(last_attempt) = link.last_attempt_at {
                if last_attempt.elapsed() < MIN_ATTEMPT_INTERVAL {
                    return false;
                }
            }
        }
        self.connected_central_count() < profile.max_connections()
    }

    fn connected_central_count(&self) -> usize {
        self.links
            .iter()
            .filter(|entry| {
                entry.key().role == LinkRole::Central
                    && matches!(entry.value().state, LinkState::Connected | LinkState::Subscribed)
            })
            .count()
    }

    pub fn begin_attempt(&self, device_id: u64) {
        let id = LinkId {
            device_id,
            role: LinkRole::Central,
        };
        self.links.entry(id).and_modify(|link| {
            link.state = LinkState::Connecting;
            link.connect_attempts += 1;
            link.last_attempt_at = Some(Instant::now());
        });
    }

    pub fn mark_connected(&self, id: LinkId) {
        self.links
            .entry(id)
            .and_modify(|link| {
                link.state = LinkState::Connected;
                link.last_seen = Instant::now();
            })
            .or_insert_with(|| {
                let mut link = Link::new(0);
                link.state = LinkState::Connected;
                link
            });
    }

    pub fn mark_subscribed(&self, id: LinkId) {
        if let Some(mut link) = self.links.get_mut(&id) {
            link.state = LinkState::Subscribed;
        }
    }

    /// Mark a link disconnected and, for central-role links, schedule the
    /// next retry with exponential backoff (§4.4). `immediate` distinguishes
    /// the status-147-style abrupt loss (no grace period before reconnect
    /// eligibility beyond the backoff itself) from an orderly disconnect,
    /// which callers may choose to delay before calling this.
    pub fn mark_disconnected(&self, id: LinkId, immediate: bool) {
        let _ = immediate;
        if let Some(mut link) = self.links.get_mut(&id) {
            link.state = LinkState::Disconnected;
            if id.role == LinkRole::Central {
                let backoff = Link::backoff_for_attempt(link.connect_attempts);
                link.backoff_until = Some(Instant::now() + backoff);
            }
        }
    }

    pub fn reset_backoff(&self, id: LinkId) {
        if let Some(mut link) = self.links.get_mut(&id) {
            link.connect_attempts = 0;
            link.backoff_until = None;
        }
    }

    /// The strongest currently usable links (subscribed central links or
    /// connected peripheral links), ranked by RSSI descending. Used by the
    /// router for link selection when more than one path to a peer exists.
    pub fn best_links(&self, limit: usize) -> Vec<(LinkId, i16)> {
        let mut usable: Vec<(LinkId, i16)> = self
            .links
            .iter()
            .filter(|entry| matches!(entry.value().state, LinkState::Connected | LinkState::Subscribed))
            .map(|entry| (*entry.key(), entry.value().rssi))
            .collect();
        usable.sort_by(|a, b| b.1.cmp(&a.1));
        usable.truncate(limit);
        usable
    }

    pub fn state_of(&self, id: LinkId) -> Option<LinkState> {
        self.links.get(&id).map(|link| link.state)
    }

    /// Drop stale discovered-but-never-connected entries so the table
    /// doesn't grow unbounded across a long scan session.
    pub fn prune_stale_discoveries(&self, max_age: Duration) {
        let now = Instant::now();
        self.links.retain(|_, link| {
            !(link.state == LinkState::Discovered && now.duration_since(link.last_seen) > max_age)
        });
    }

    #[cfg(test)]
    fn snapshot(&self) -> HashMap<LinkId, LinkState> {
        self.links.iter().map(|entry| (*entry.key(), entry.value().state)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_then_connect_then_subscribe_progresses_state() {
        let tracker = ConnectionTracker::new();
        tracker.register_scan_result(1, -50);
        assert!(tracker.is_connect_allowed(1, PowerProfile::Balanced));
        tracker.begin_attempt(1);
        let id = LinkId { device_id: 1, role: LinkRole::Central };
        tracker.mark_connected(id);
        assert_eq!(tracker.state_of(id), Some(LinkState::Connected));
        tracker.mark_subscribed(id);
        assert_eq!(tracker.state_of(id), Some(LinkState::Subscribed));
        assert_eq!(tracker.best_links(10), vec![(id, -50)]);
    }

    #[test]
    fn disconnect_applies_exponential_backoff_up_to_the_cap() {
        let tracker = ConnectionTracker::new();
        tracker.register_scan_result(1, -50);
        let id = LinkId { device_id: 1, role: LinkRole::Central };
        for _ in 0..8 {
            tracker.begin_attempt(1);
            tracker.mark_disconnected(id, true);
        }
        assert!(!tracker.is_connect_allowed(1, PowerProfile::Balanced));
        let link = tracker.links.get(&id).unwrap();
        assert!(link.backoff_until.is_some());
        let remaining = link.backoff_until.unwrap().saturating_duration_since(Instant::now());
        assert!(remaining <= BACKOFF_CAP);
    }

    #[test]
    fn max_connections_cap_blocks_further_attempts() {
        let tracker = ConnectionTracker::new();
        let max = PowerProfile::PowerSaver.max_connections();
        for device in 0..max as u64 {
            let id = LinkId { device_id: device, role: LinkRole::Central };
            tracker.mark_connected(id);
        }
        tracker.register_scan_result(max as u64 + 1, -40);
        assert!(!tracker.is_connect_allowed(max as u64 + 1, PowerProfile::PowerSaver));
    }

    #[test]
    fn already_connected_or_connecting_blocks_a_second_attempt() {
        let tracker = ConnectionTracker::new();
        let id = LinkId { device_id: 1, role: LinkRole::Central };

        tracker.register_scan_result(1, -50);
        tracker.begin_attempt(1);
        assert!(!tracker.is_connect_allowed(1, PowerProfile::Balanced));

        tracker.mark_connected(id);
        assert!(!tracker.is_connect_allowed(1, PowerProfile::Balanced));

        tracker.mark_subscribed(id);
        assert!(!tracker.is_connect_allowed(1, PowerProfile::Balanced));
    }

    #[test]
    fn rapid_rescan_of_the_same_address_is_rate_limited() {
        let tracker = ConnectionTracker::new();
        tracker.register_scan_result(1, -50);
        tracker.begin_attempt(1);
        tracker.mark_disconnected(LinkId { device_id: 1, role: LinkRole::Central }, true);
        tracker.reset_backoff(LinkId { device_id: 1, role: LinkRole::Central });

        // Backoff was just cleared, but the attempt happened moments ago —
        // the 5s per-address rate limit still blocks a second connect.
        assert!(!tracker.is_connect_allowed(1, PowerProfile::Balanced));
    }
}
