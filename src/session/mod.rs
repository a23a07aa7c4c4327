//! Noise session manager (§4.3 "Noise session manager").
//!
//! Drives one Noise XX handshake per remote peer and holds the resulting
//! transport cipher for the life of the session. Sessions are keyed by the
//! peer's `static_fingerprint`, which survives ephemeral peer ID rotation;
//! a secondary index keyed by the peer's *current* ephemeral ID exists only
//! for the brief window before a responder has seen the initiator's static
//! key (handshake message 3) and can resolve the fingerprint.

mod noise;
mod state;

pub use noise::{HandshakeDriver, TransportCipher, NONCE_REKEY_THRESHOLD};
pub use state::SessionState;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::crypto::{fingerprint_of, Identity, StaticFingerprint};
use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// A handshake stalled for longer than this is abandoned (§4.3, §7
/// `crypto_handshake_timeout`).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive decrypt failures inside [`DECRYPT_FAILURE_WINDOW`] mark a
/// session failed and schedule a fresh handshake (§4.3, §7
/// `crypto_decrypt_failure`).
pub const DECRYPT_FAILURE_THRESHOLD: u32 = 5;
pub const DECRYPT_FAILURE_WINDOW: Duration = Duration::from_secs(10);

struct Session {
    state: SessionState,
    driver: Option<HandshakeDriver>,
    cipher: Option<TransportCipher>,
    is_initiator: bool,
    peer_ephemeral_id: PeerId,
    started_at: Instant,
    decrypt_failures: VecDeque<Instant>,
}

impl Session {
    fn handshaking(is_initiator: bool, peer_ephemeral_id: PeerId, driver: HandshakeDriver) -> Self {
        Self {
            state: SessionState::Handshaking,
            driver: Some(driver),
            cipher: None,
            is_initiator,
            peer_ephemeral_id,
            started_at: Instant::now(),
            decrypt_failures: VecDeque::new(),
        }
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.state == SessionState::Handshaking && self.started_at.elapsed() > timeout
    }
}

/// Outcome of feeding a handshake message into the manager.
pub enum HandshakeStep {
    /// Another handshake message must be sent back to the peer.
    Reply(Vec<u8>),
    /// The handshake completed; the session is now established. Carries a
    /// final handshake message that must still be delivered to the peer if
    /// one was produced (XX message 3, sent by the initiator).
    Established {
        fingerprint: StaticFingerprint,
        final_message: Option<Vec<u8>>,
    },
}

/// Per-node Noise session state, holding one session per remote peer.
pub struct NoiseSessionManager {
    identity: Identity,
    handshake_timeout: Duration,
    sessions: DashMap<StaticFingerprint, Session>,
    /// Pending responder-side handshakes not yet resolved to a fingerprint,
    /// keyed by the initiator's ephemeral peer ID.
    pending_by_peer_id: DashMap<PeerId, Session>,
}

impl NoiseSessionManager {
    pub fn new(identity: Identity, handshake_timeout: Duration) -> Self {
        Self {
            identity,
            handshake_timeout,
            sessions: DashMap::new(),
            pending_by_peer_id: DashMap::new(),
        }
    }

    /// Start a handshake as initiator toward a peer we already have a
    /// fingerprint for (e.g. from a prior session). Returns the first
    /// handshake message to send.
    pub fn initiate(&self, fingerprint: StaticFingerprint, peer_ephemeral_id: PeerId) -> Result<Vec<u8>> {
        let mut driver = HandshakeDriver::initiator(&self.identity.noise_static_key)?;
        let message = driver.write_message()?;
        self.sessions
            .insert(fingerprint, Session::handshaking(true, peer_ephemeral_id, driver));
        Ok(message)
    }

    /// True if we already have an in-flight initiator handshake toward this
    /// exact peer (by ephemeral ID), used to resolve simultaneous initiation.
    fn has_pending_initiation_to(&self, peer_ephemeral_id: PeerId) -> bool {
        self.sessions
            .iter()
            .any(|entry| entry.is_initiator && entry.state == SessionState::Handshaking && entry.peer_ephemeral_id == peer_ephemeral_id)
    }

    /// Accept the first inbound handshake message from `peer_ephemeral_id`.
    /// Identity is not yet known, so this is tracked in the pending table.
    ///
    /// Returns `Ok(None)` if this message loses the simultaneous-initiation
    /// tie-break against our own in-flight initiation and should be
    /// silently ignored (§4.3): the peer is expected to run the same
    /// comparison and yield to us instead.
    pub fn accept_first_message(&self, own_ephemeral_id: PeerId, peer_ephemeral_id: PeerId, message: &[u8]) -> Result<Option<Vec<u8>>> {
        if own_ephemeral_id.as_bytes() <= peer_ephemeral_id.as_bytes() && self.has_pending_initiation_to(peer_ephemeral_id) {
            debug!(?peer_ephemeral_id, "ignoring inbound handshake, we remain initiator per tie-break");
            return Ok(None);
        }
        if self.has_pending_initiation_to(peer_ephemeral_id) {
            debug!(?peer_ephemeral_id, "yielding initiator role, simultaneous handshake tie-break");
            self.sessions
                .retain(|_, session| !(session.is_initiator && session.peer_ephemeral_id == peer_ephemeral_id));
        }

        let mut driver = HandshakeDriver::responder(&self.identity.noise_static_key)?;
        driver.read_message(message)?;
        let reply = driver.write_message()?;
        self.pending_by_peer_id
            .insert(peer_ephemeral_id, Session::handshaking(false, peer_ephemeral_id, driver));
        Ok(Some(reply))
    }

    /// Feed a handshake message addressed to an existing initiator-side
    /// session (message 2 of XX), or a final message completing a
    /// responder-side session (message 3).
    pub fn handle_message(
        &self,
        peer_ephemeral_id: PeerId,
        expected_fingerprint: Option<StaticFingerprint>,
        message: &[u8],
    ) -> Result<HandshakeStep> {
        if let Some(fingerprint) = expected_fingerprint {
            if let Some(mut entry) = self.sessions.get_mut(&fingerprint) {
                if entry.is_initiator {
                    return self.advance_initiator(&mut entry, peer_ephemeral_id, message);
                }
            }
        }

        if let Some(mut entry) = self.pending_by_peer_id.get_mut(&peer_ephemeral_id) {
            entry.driver.as_mut().expect("pending session always mid-handshake").read_message(message)?;
            let finished = entry.driver.as_ref().unwrap().is_handshake_finished();
            if finished {
                let remote_static = entry
                    .driver
                    .as_ref()
                    .unwrap()
                    .remote_static()
                    .ok_or_else(|| Error::InvalidState("handshake finished without remote static key".into()))?;
                let fingerprint = fingerprint_of(&remote_static);
                let mut session = self.pending_by_peer_id.remove(&peer_ephemeral_id).unwrap().1;
                let cipher = session.driver.take().unwrap().into_transport()?;
                session.cipher = Some(cipher);
                session.state = SessionState::Established;
                self.sessions.insert(fingerprint, session);
                return Ok(HandshakeStep::Established {
                    fingerprint,
                    final_message: None,
                });
            }
            return Err(Error::InvalidState("unexpected extra handshake message".into()));
        }

        Err(Error::SessionNotFound)
    }

    fn advance_initiator(
        &self,
        entry: &mut dashmap::mapref::one::RefMut<'_, StaticFingerprint, Session>,
        peer_ephemeral_id: PeerId,
        message: &[u8],
    ) -> Result<HandshakeStep> {
        let driver = entry.driver.as_mut().ok_or_else(|| Error::InvalidState("session has no handshake driver".into()))?;
        driver.read_message(message)?;
        let final_message = driver.write_message()?;
        if driver.is_handshake_finished() {
            let remote_static = driver
                .remote_static()
                .ok_or_else(|| Error::InvalidState("handshake finished without remote static key".into()))?;
            let fingerprint = fingerprint_of(&remote_static);
            let driver = entry.driver.take().unwrap();
            let cipher = driver.into_transport()?;
            entry.cipher = Some(cipher);
            entry.state = SessionState::Established;
            entry.peer_ephemeral_id = peer_ephemeral_id;
            return Ok(HandshakeStep::Established {
                fingerprint,
                final_message: Some(final_message),
            });
        }
        Ok(HandshakeStep::Reply(final_message))
    }

    /// Encrypt `plaintext` for an established session.
    pub fn encrypt(&self, fingerprint: &StaticFingerprint, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut entry = self.sessions.get_mut(fingerprint).ok_or(Error::SessionNotFound)?;
        if entry.state != SessionState::Established {
            return Err(Error::InvalidState("session is not established".into()));
        }
        let cipher = entry.cipher.as_mut().expect("established session always has a cipher");
        let result = cipher.encrypt(plaintext);
        if matches!(result, Err(Error::CryptoNonceExhausted)) {
            entry.state = SessionState::Failed;
        }
        result
    }

    /// Decrypt `ciphertext` for an established session, tracking decrypt
    /// failures and tripping the session to `Failed` after
    /// [`DECRYPT_FAILURE_THRESHOLD`] failures inside
    /// [`DECRYPT_FAILURE_WINDOW`] (§4.3, §7).
    pub fn decrypt(&self, fingerprint: &StaticFingerprint, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut entry = self.sessions.get_mut(fingerprint).ok_or(Error::SessionNotFound)?;
        if entry.state != SessionState::Established {
            return Err(Error::InvalidState("session is not established".into()));
        }
        let cipher = entry.cipher.as_mut().expect("established session always has a cipher");
        match cipher.decrypt(ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                let now = Instant::now();
                entry.decrypt_failures.push_back(now);
                while let Some(&front) = entry.decrypt_failures.front() {
                    if now.duration_since(front) > DECRYPT_FAILURE_WINDOW {
                        entry.decrypt_failures.pop_front();
                    } else {
                        break;
                    }
                }
                if entry.decrypt_failures.len() as u32 >= DECRYPT_FAILURE_THRESHOLD {
                    warn!(?fingerprint, "too many decrypt failures, marking session failed");
                    entry.state = SessionState::Failed;
                }
                Err(err)
            }
        }
    }

    pub fn state_of(&self, fingerprint: &StaticFingerprint) -> SessionState {
        self.sessions.get(fingerprint).map(|s| s.state).unwrap_or(SessionState::None)
    }

    /// Drop handshakes that have been stalled past the handshake timeout
    /// (§4.3, §7 `crypto_handshake_timeout`). Call periodically.
    pub fn reap_expired_handshakes(&self) {
        self.sessions.retain(|_, session| !session.is_expired(self.handshake_timeout));
        self.pending_by_peer_id.retain(|_, session| !session.is_expired(self.handshake_timeout));
    }

    /// Remove a failed session so the next `initiate` starts clean.
    pub fn drop_session(&self, fingerprint: &StaticFingerprint) {
        self.sessions.remove(fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> NoiseSessionManager {
        NoiseSessionManager::new(Identity::generate(), DEFAULT_HANDSHAKE_TIMEOUT)
    }

    #[test]
    fn full_handshake_establishes_a_working_session_on_both_sides() {
        let initiator_mgr = manager();
        let responder_mgr = manager();
        let initiator_id = PeerId::new([1; 8]);
        let responder_id = PeerId::new([2; 8]);

        let responder_fingerprint = responder_mgr.identity.static_fingerprint;
        let initiator_fingerprint = initiator_mgr.identity.static_fingerprint;

        let m1 = initiator_mgr.initiate(responder_fingerprint, responder_id).unwrap();
        let m2 = responder_mgr.accept_first_message(responder_id, initiator_id, &m1).unwrap().expect("no tie-break in this scenario");

        let step = initiator_mgr
            .handle_message(responder_id, Some(responder_fingerprint), &m2)
            .unwrap();
        let final_message = match step {
            HandshakeStep::Established { fingerprint, final_message } => {
                assert_eq!(fingerprint, responder_fingerprint);
                final_message.expect("initiator produces message 3 in XX")
            }
            _ => panic!("initiator should finish on message 2 in XX"),
        };
        assert_eq!(initiator_mgr.state_of(&responder_fingerprint), SessionState::Established);

        let step = responder_mgr
            .handle_message(initiator_id, None, &final_message)
            .unwrap();
        match step {
            HandshakeStep::Established { fingerprint, .. } => assert_eq!(fingerprint, initiator_fingerprint),
            _ => panic!("responder should finish on message 3 in XX"),
        }
        assert_eq!(responder_mgr.state_of(&initiator_fingerprint), SessionState::Established);

        let ciphertext = initiator_mgr.encrypt(&responder_fingerprint, b"hello mesh").unwrap();
        let plaintext = responder_mgr.decrypt(&initiator_fingerprint, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello mesh");
    }

    fn established_pair() -> (NoiseSessionManager, NoiseSessionManager, StaticFingerprint, StaticFingerprint) {
        let initiator_mgr = manager();
        let responder_mgr = manager();
        let initiator_id = PeerId::new([1; 8]);
        let responder_id = PeerId::new([2; 8]);
        let responder_fingerprint = responder_mgr.identity.static_fingerprint;
        let initiator_fingerprint = initiator_mgr.identity.static_fingerprint;

        let m1 = initiator_mgr.initiate(responder_fingerprint, responder_id).unwrap();
        let m2 = responder_mgr.accept_first_message(responder_id, initiator_id, &m1).unwrap().expect("no tie-break in this scenario");
        let step = initiator_mgr
            .handle_message(responder_id, Some(responder_fingerprint), &m2)
            .unwrap();
        let final_message = match step {
            HandshakeStep::Established { final_message, .. } => final_message.unwrap(),
            _ => panic!("expected established"),
        };
        responder_mgr
            .handle_message(initiator_id, None, &final_message)
            .unwrap();

        (initiator_mgr, responder_mgr, initiator_fingerprint, responder_fingerprint)
    }

    #[test]
    fn decrypt_failures_trip_session_to_failed_after_threshold() {
        let (initiator_mgr, responder_mgr, initiator_fingerprint, responder_fingerprint) = established_pair();
        let ciphertext = initiator_mgr.encrypt(&responder_fingerprint, b"hello").unwrap();
        let mut corrupted = ciphertext.clone();
        corrupted[0] ^= 0xFF;

        for _ in 0..DECRYPT_FAILURE_THRESHOLD {
            assert!(responder_mgr.decrypt(&initiator_fingerprint, &corrupted).is_err());
        }
        assert_eq!(responder_mgr.state_of(&initiator_fingerprint), SessionState::Failed);
    }

    #[test]
    fn simultaneous_initiation_is_resolved_by_ephemeral_id_ordering() {
        let low_mgr = manager();
        let high_mgr = manager();
        let low_id = PeerId::new([1; 8]);
        let high_id = PeerId::new([2; 8]);
        let low_fingerprint = low_mgr.identity.static_fingerprint;
        let high_fingerprint = high_mgr.identity.static_fingerprint;

        // Both sides initiate toward each other before either's message
        // arrives.
        let low_to_high = low_mgr.initiate(high_fingerprint, high_id).unwrap();
        let high_to_low = high_mgr.initiate(low_fingerprint, low_id).unwrap();

        // `high_id` is the larger ephemeral ID, so `high_mgr` yields: its
        // inbound `accept_first_message` call for the lower peer succeeds
        // (it takes on the responder role), while `low_mgr` ignores the
        // inbound message and keeps its own initiator session alive.
        let reply_from_high = high_mgr
            .accept_first_message(high_id, low_id, &low_to_high)
            .unwrap()
            .expect("higher ephemeral id yields and responds");

        let ignored = low_mgr.accept_first_message(low_id, high_id, &high_to_low).unwrap();
        assert!(ignored.is_none(), "lower ephemeral id keeps its own initiation and ignores the peer's");

        let step = low_mgr.handle_message(high_id, Some(high_fingerprint), &reply_from_high).unwrap();
        let final_message = match step {
            HandshakeStep::Established { final_message, .. } => final_message.unwrap(),
            HandshakeStep::Reply(_) => panic!("expected xx to finish for the initiator on message 2"),
        };
        high_mgr.handle_message(low_id, None, &final_message).unwrap();

        assert_eq!(low_mgr.state_of(&high_fingerprint), SessionState::Established);
        assert_eq!(high_mgr.state_of(&low_fingerprint), SessionState::Established);
    }
}
