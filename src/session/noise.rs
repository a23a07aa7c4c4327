//! Noise XX handshake driver and post-handshake transport cipher (§4.3).
//!
//! Wraps `snow`'s `HandshakeState`/`TransportState` with the crate's own
//! explicit, independently-tracked send/receive nonce counters rather than
//! trusting snow's internal auto-incrementing ones: the spec's nonce
//! properties (strict monotonic, reject stale/skipped nonces without
//! advancing state, rekey at 2^48) are verified against these counters
//! directly, not against snow's implicit bookkeeping.

use snow::{Builder, HandshakeState, TransportState};

use crate::crypto::NoiseStaticKeypair;
use crate::error::{Error, Result};

/// `Noise_XX_25519_ChaChaPoly_SHA256`, the only pattern this crate speaks.
const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Nonces are 64-bit but a rekey is forced well before exhaustion so neither
/// side ever approaches the AEAD's real limit (§4.3 "nonce_exhaustion").
pub const NONCE_REKEY_THRESHOLD: u64 = 1 << 48;

fn builder(local_private: &[u8; 32]) -> Result<Builder<'static>> {
    let params = NOISE_PARAMS.parse().map_err(|_| Error::InvalidState("bad noise params".into()))?;
    Ok(Builder::new(params).local_private_key(local_private))
}

/// The handshake half of a Noise session: drives the 3-message XX exchange
/// to completion, then hands back a [`TransportCipher`].
pub struct HandshakeDriver {
    state: HandshakeState,
}

impl HandshakeDriver {
    pub fn initiator(local_key: &NoiseStaticKeypair) -> Result<Self> {
        let state = builder(local_key.private_bytes())?
            .build_initiator()
            .map_err(Error::Noise)?;
        Ok(Self { state })
    }

    pub fn responder(local_key: &NoiseStaticKeypair) -> Result<Self> {
        let state = builder(local_key.private_bytes())?
            .build_responder()
            .map_err(Error::Noise)?;
        Ok(Self { state })
    }

    /// Produce the next outbound handshake message (payload is always empty
    /// for this crate's use of XX — no early data).
    pub fn write_message(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 256];
        let len = self.state.write_message(&[], &mut buf).map_err(Error::Noise)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume an inbound handshake message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<()> {
        let mut buf = vec![0u8; message.len()];
        self.state.read_message(message, &mut buf).map_err(Error::Noise)?;
        Ok(())
    }

    pub fn is_handshake_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// The remote static public key, available once it has been transmitted
    /// (after message 2 of XX). Used to verify against the expected
    /// `static_fingerprint` before trusting the session (§4.3).
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().map(|bytes| {
            let mut out = [0u8; 32];
            out.copy_from_slice(bytes);
            out
        })
    }

    /// Finish the handshake and switch to transport mode.
    pub fn into_transport(self) -> Result<TransportCipher> {
        let transport = self.state.into_transport_mode().map_err(Error::Noise)?;
        Ok(TransportCipher::new(transport))
    }
}

/// Post-handshake AEAD transport with explicit, independently tracked
/// send/receive nonce counters (§3 "independent monotonically increasing
/// nonce counters for sending and receiving").
pub struct TransportCipher {
    state: TransportState,
    send_nonce: u64,
    recv_nonce: u64,
}

impl TransportCipher {
    fn new(state: TransportState) -> Self {
        Self {
            state,
            send_nonce: 0,
            recv_nonce: 0,
        }
    }

    pub fn send_nonce(&self) -> u64 {
        self.send_nonce
    }

    pub fn recv_nonce(&self) -> u64 {
        self.recv_nonce
    }

    /// Encrypt `plaintext` at the next send nonce. Errors if the send nonce
    /// space is exhausted; the caller is expected to trigger a rekey.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.send_nonce >= NONCE_REKEY_THRESHOLD {
            return Err(Error::CryptoNonceExhausted);
        }
        debug_assert_eq!(self.state.sending_nonce(), self.send_nonce);
        let mut buf = vec![0u8; plaintext.len() + 16];
        let len = self.state.write_message(plaintext, &mut buf).map_err(Error::Noise)?;
        buf.truncate(len);
        self.send_nonce += 1;
        Ok(buf)
    }

    /// Decrypt `ciphertext`, requiring it to be exactly at the next expected
    /// receive nonce. Anything else — a replay at `n-1` or a skip to `n+2` —
    /// fails AEAD authentication (the nonce is part of the construction) and
    /// the receive counter is left untouched (§8 Noise testable property).
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.recv_nonce >= NONCE_REKEY_THRESHOLD {
            return Err(Error::CryptoNonceExhausted);
        }
        let plaintext = self.decrypt_at(self.recv_nonce, ciphertext)?;
        self.recv_nonce += 1;
        Ok(plaintext)
    }

    /// Attempt decryption at an explicit nonce without advancing state.
    /// Exposed so nonce-ordering properties can be exercised directly in
    /// tests; production callers should use [`Self::decrypt`].
    pub fn decrypt_at(&mut self, nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.state.set_receiving_nonce(nonce);
        let mut buf = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(ciphertext, &mut buf)
            .map_err(|_| Error::CryptoDecryptFailed)?;
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (TransportCipher, TransportCipher) {
        let initiator_key = NoiseStaticKeypair::generate();
        let responder_key = NoiseStaticKeypair::generate();

        let mut initiator = HandshakeDriver::initiator(&initiator_key).unwrap();
        let mut responder = HandshakeDriver::responder(&responder_key).unwrap();

        // XX: -> e, <- e, ee, s, es, -> s, se
        let m1 = initiator.write_message().unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message().unwrap();
        initiator.read_message(&m2).unwrap();
        let m3 = initiator.write_message().unwrap();
        responder.read_message(&m3).unwrap();

        assert!(initiator.is_handshake_finished());
        assert!(responder.is_handshake_finished());
        assert_eq!(responder.remote_static().unwrap(), initiator_key.public_bytes());
        assert_eq!(initiator.remote_static().unwrap(), responder_key.public_bytes());

        (initiator.into_transport().unwrap(), responder.into_transport().unwrap())
    }

    #[test]
    fn transport_round_trips_in_both_directions() {
        let (mut a, mut b) = established_pair();

        let ct = a.encrypt(b"hello from a").unwrap();
        assert_eq!(b.decrypt(&ct).unwrap(), b"hello from a");

        let ct2 = b.encrypt(b"hello from b").unwrap();
        assert_eq!(a.decrypt(&ct2).unwrap(), b"hello from b");
    }

    #[test]
    fn replayed_or_skipped_nonce_is_rejected_without_advancing_state() {
        let (mut a, mut b) = established_pair();

        let ct0 = a.encrypt(b"message zero").unwrap();
        let ct1 = a.encrypt(b"message one").unwrap();
        let ct2 = a.encrypt(b"message two").unwrap();

        // Correctly accept nonce 0.
        assert_eq!(b.decrypt(&ct0).unwrap(), b"message zero");
        assert_eq!(b.recv_nonce(), 1);

        // Replay at n-1 (nonce 0 again) must fail and must not move the
        // expected-next-nonce counter.
        assert!(b.decrypt(&ct0).is_err());
        assert_eq!(b.recv_nonce(), 1);

        // Skip ahead to n+2 (nonce 2, expected is 1) must also fail.
        assert!(b.decrypt(&ct2).is_err());
        assert_eq!(b.recv_nonce(), 1);

        // The actually-expected next message still decrypts correctly.
        assert_eq!(b.decrypt(&ct1).unwrap(), b"message one");
        assert_eq!(b.recv_nonce(), 2);
    }

    #[test]
    fn encrypt_refuses_past_the_rekey_threshold() {
        let (mut a, _b) = established_pair();
        a.send_nonce = NONCE_REKEY_THRESHOLD;
        assert!(matches!(a.encrypt(b"x"), Err(Error::CryptoNonceExhausted)));
    }
}
