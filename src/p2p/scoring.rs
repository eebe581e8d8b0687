use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p::PeerId;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::PeerScoringConfig;

pub const INITIAL_PEER_SCORE: i32 = 100;

pub const SCORE_VALID_MESSAGE: i32 = 1;
pub const SCORE_INVALID_MESSAGE: i32 = -10;
pub const SCORE_TIMEOUT: i32 = -5;
pub const SCORE_MALFORMED: i32 = -20;

const SCORE_DECAY_AMOUNT: i32 = 1;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PeerScore {
    pub peer_id: PeerId,
    pub score: i32,
    pub quarantined: bool,
    pub banned: bool,
    pub valid_count: u64,
    pub invalid_count: u64,
    pub last_seen: Instant,
    pub first_seen: Instant,
}

impl PeerScore {
    fn new(peer_id: PeerId) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            score: INITIAL_PEER_SCORE,
            quarantined: false,
            banned: false,
            valid_count: 0,
            invalid_count: 0,
            last_seen: now,
            first_seen: now,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoringStats {
    pub total_peers: usize,
    pub quarantined: usize,
    pub banned: usize,
    pub total_valid: u64,
    pub total_invalid: u64,
}

/// Per-peer reputation table. A leaf component: it records observations and
/// answers queries, and calls nothing else.
pub struct PeerScoring {
    config: PeerScoringConfig,
    scores: RwLock<HashMap<PeerId, PeerScore>>,
}

impl PeerScoring {
    pub fn new(config: PeerScoringConfig) -> Self {
        Self {
            config,
            scores: RwLock::new(HashMap::new()),
        }
    }

    fn adjust<F>(&self, peer_id: PeerId, delta: i32, update: F)
    where
        F: FnOnce(&mut PeerScore),
    {
        let mut scores = self.scores.write();
        let entry = scores
            .entry(peer_id)
            .or_insert_with(|| PeerScore::new(peer_id));
        entry.score += delta;
        entry.last_seen = Instant::now();
        update(entry);

        if entry.score <= self.config.ban_threshold && !entry.banned {
            entry.banned = true;
            warn!(peer = %peer_id, score = entry.score, "peer banned");
        } else if entry.score < self.config.quarantine_threshold && !entry.quarantined {
            entry.quarantined = true;
            warn!(peer = %peer_id, score = entry.score, "peer quarantined");
        }
    }

    pub fn record_valid(&self, peer_id: PeerId) {
        self.adjust(peer_id, SCORE_VALID_MESSAGE, |entry| {
            entry.valid_count += 1;
        });
    }

    pub fn record_invalid(&self, peer_id: PeerId) {
        self.adjust(peer_id, SCORE_INVALID_MESSAGE, |entry| {
            entry.invalid_count += 1;
        });
    }

    pub fn record_timeout(&self, peer_id: PeerId) {
        self.adjust(peer_id, SCORE_TIMEOUT, |_| {});
    }

    pub fn record_malformed(&self, peer_id: PeerId) {
        self.adjust(peer_id, SCORE_MALFORMED, |entry| {
            entry.invalid_count += 1;
        });
    }

    pub fn score(&self, peer_id: &PeerId) -> i32 {
        self.scores
            .read()
            .get(peer_id)
            .map(|entry| entry.score)
            .unwrap_or(INITIAL_PEER_SCORE)
    }

    pub fn is_quarantined(&self, peer_id: &PeerId) -> bool {
        self.scores
            .read()
            .get(peer_id)
            .map(|entry| entry.quarantined)
            .unwrap_or(false)
    }

    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.scores
            .read()
            .get(peer_id)
            .map(|entry| entry.banned)
            .unwrap_or(false)
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerScore> {
        self.scores.read().get(peer_id).cloned()
    }

    pub fn all(&self) -> Vec<PeerScore> {
        self.scores.read().values().cloned().collect()
    }

    pub fn reset(&self, peer_id: &PeerId) {
        if let Some(entry) = self.scores.write().get_mut(peer_id) {
            entry.score = INITIAL_PEER_SCORE;
            entry.quarantined = false;
            entry.banned = false;
            info!(peer = %peer_id, "peer score reset");
        }
    }

    pub fn remove(&self, peer_id: &PeerId) {
        self.scores.write().remove(peer_id);
    }

    pub fn stats(&self) -> ScoringStats {
        let scores = self.scores.read();
        let mut stats = ScoringStats {
            total_peers: scores.len(),
            quarantined: 0,
            banned: 0,
            total_valid: 0,
            total_invalid: 0,
        };
        for entry in scores.values() {
            if entry.banned {
                stats.banned += 1;
            } else if entry.quarantined {
                stats.quarantined += 1;
            }
            stats.total_valid += entry.valid_count;
            stats.total_invalid += entry.invalid_count;
        }
        stats
    }

    /// Forgiveness pass: scores below initial recover one point, and peers
    /// whose score re-crosses a threshold leave quarantine or the ban list.
    pub fn apply_decay(&self) {
        let mut recovered = 0usize;
        let mut scores = self.scores.write();
        for entry in scores.values_mut() {
            if entry.score >= INITIAL_PEER_SCORE {
                continue;
            }
            entry.score = (entry.score + SCORE_DECAY_AMOUNT).min(INITIAL_PEER_SCORE);
            if entry.quarantined && entry.score >= self.config.quarantine_threshold {
                entry.quarantined = false;
                recovered += 1;
            }
            if entry.banned && entry.score > self.config.ban_threshold {
                entry.banned = false;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "peers recovered from quarantine or ban");
        }
    }

    /// Evict peers with no activity inside the stale window.
    pub fn evict_stale(&self) -> usize {
        let stale_after = self.config.stale_timeout();
        let mut scores = self.scores.write();
        let before = scores.len();
        scores.retain(|_, entry| entry.last_seen.elapsed() <= stale_after);
        let evicted = before - scores.len();
        if evicted > 0 {
            debug!(evicted, remaining = scores.len(), "evicted stale peers");
        }
        evicted
    }

    /// Stale-peer cleanup loop.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scoring = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        scoring.evict_stale();
                    }
                }
            }
        })
    }

    /// Score recovery loop.
    pub fn spawn_decay(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scoring = Arc::clone(self);
        let interval = scoring.config.decay_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        scoring.apply_decay();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoring() -> PeerScoring {
        PeerScoring::new(PeerScoringConfig::default())
    }

    #[test]
    fn unknown_peers_start_neutral() {
        let scoring = scoring();
        let peer = PeerId::random();
        assert_eq!(scoring.score(&peer), INITIAL_PEER_SCORE);
        assert!(!scoring.is_quarantined(&peer));
        assert!(!scoring.is_banned(&peer));
    }

    #[test]
    fn valid_messages_raise_the_score() {
        let scoring = scoring();
        let peer = PeerId::random();
        scoring.record_valid(peer);
        scoring.record_valid(peer);
        assert_eq!(scoring.score(&peer), INITIAL_PEER_SCORE + 2);
        assert_eq!(scoring.peer(&peer).expect("tracked").valid_count, 2);
    }

    #[test]
    fn ten_invalid_messages_ban_the_peer() {
        let scoring = scoring();
        let peer = PeerId::random();
        for _ in 0..9 {
            scoring.record_invalid(peer);
        }
        assert_eq!(scoring.score(&peer), 10);
        assert!(!scoring.is_banned(&peer));

        scoring.record_invalid(peer);
        assert_eq!(scoring.score(&peer), 0);
        assert!(scoring.is_banned(&peer));
    }

    #[test]
    fn quarantine_kicks_in_below_threshold() {
        let scoring = scoring();
        let peer = PeerId::random();
        // Nine invalid messages land at exactly the threshold: still clear.
        for _ in 0..9 {
            scoring.record_invalid(peer);
        }
        assert!(!scoring.is_quarantined(&peer));
        scoring.record_timeout(peer);
        assert_eq!(scoring.score(&peer), 5);
        assert!(scoring.is_quarantined(&peer));
    }

    #[test]
    fn malformed_messages_cost_twenty() {
        let scoring = scoring();
        let peer = PeerId::random();
        scoring.record_malformed(peer);
        assert_eq!(scoring.score(&peer), 80);
        assert_eq!(scoring.peer(&peer).expect("tracked").invalid_count, 1);
    }

    #[test]
    fn decay_lifts_bans_once_the_threshold_is_recrossed() {
        let scoring = scoring();
        let peer = PeerId::random();
        for _ in 0..10 {
            scoring.record_invalid(peer);
        }
        assert!(scoring.is_banned(&peer));

        scoring.apply_decay();
        assert_eq!(scoring.score(&peer), 1);
        assert!(!scoring.is_banned(&peer));
    }

    #[test]
    fn decay_releases_quarantine_at_its_own_threshold() {
        let scoring = scoring();
        let peer = PeerId::random();
        // Nine invalid plus a timeout: quarantined at score 5, not banned.
        for _ in 0..9 {
            scoring.record_invalid(peer);
        }
        scoring.record_timeout(peer);
        assert!(scoring.is_quarantined(&peer));
        assert!(!scoring.is_banned(&peer));

        for _ in 0..4 {
            scoring.apply_decay();
        }
        assert_eq!(scoring.score(&peer), 9);
        assert!(scoring.is_quarantined(&peer));

        scoring.apply_decay();
        assert_eq!(scoring.score(&peer), 10);
        assert!(!scoring.is_quarantined(&peer));
    }

    #[test]
    fn decay_caps_at_initial_score() {
        let scoring = scoring();
        let peer = PeerId::random();
        scoring.record_timeout(peer);
        for _ in 0..100 {
            scoring.apply_decay();
        }
        assert_eq!(scoring.score(&peer), INITIAL_PEER_SCORE);
    }

    #[test]
    fn stale_peers_are_evicted() {
        let config = PeerScoringConfig {
            stale_timeout_secs: 0,
            ..PeerScoringConfig::default()
        };
        let scoring = PeerScoring::new(config);
        let peer = PeerId::random();
        scoring.record_valid(peer);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(scoring.evict_stale(), 1);
        assert!(scoring.peer(&peer).is_none());
    }

    #[test]
    fn stats_aggregate_the_table() {
        let scoring = scoring();
        let good = PeerId::random();
        let bad = PeerId::random();
        scoring.record_valid(good);
        for _ in 0..10 {
            scoring.record_invalid(bad);
        }
        let stats = scoring.stats();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.banned, 1);
        assert_eq!(stats.total_valid, 1);
        assert_eq!(stats.total_invalid, 10);
    }
}
