//! Three-message handshake.
//!
//! ```text
//!   Listener                         Dialer
//!      │── handshake {iv, systemPort} ─▶│   1/3 offer
//!      │◀─ handshake {systemPort} ──────│   2/3 reply
//!      │── ack ────────────────────────▶│   3/3 ack
//! ```
//!
//! All three frames travel in plaintext. The cipher only engages once both
//! sides hold the IV carried by the offer.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::cipher::Iv;
use crate::config::TransportConfig;
use crate::framing;
use crate::key::{Key, KeyGenerator, NULL_KEY};
use crate::message::{Message, Payload, CMD_ACK, CMD_HANDSHAKE};
use crate::TransportError;

/// The step a handshake failed at, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Offer,
    Reply,
    Ack,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::Offer => f.write_str("1/3 (offer)"),
            HandshakeStep::Reply => f.write_str("2/3 (reply)"),
            HandshakeStep::Ack => f.write_str("3/3 (ack)"),
        }
    }
}

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted the connection; owns the IV.
    Listener { iv: Iv },
    /// Opened the connection.
    Dialer,
}

/// Progress of a [`Handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    /// Listener: offer written, waiting for the reply.
    SentOffer,
    /// Dialer: waiting for the offer.
    AwaitOffer,
    /// Dialer: reply written, waiting for the ack.
    SentReply,
    /// Listener: ack written.
    SentAck,
    Established,
    Failed(HandshakeStep),
}

impl HandshakeState {
    /// The step that is in flight in this state.
    fn step(&self) -> HandshakeStep {
        match self {
            HandshakeState::Start | HandshakeState::AwaitOffer => HandshakeStep::Offer,
            HandshakeState::SentOffer => HandshakeStep::Reply,
            HandshakeState::SentReply | HandshakeState::SentAck | HandshakeState::Established => {
                HandshakeStep::Ack
            }
            HandshakeState::Failed(step) => *step,
        }
    }
}

/// What a completed handshake established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// The remote identity.
    pub peer: Key,
    /// The port the remote accepts further connections on.
    pub peer_system_port: u16,
    /// The connection IV (ours as listener, learned as dialer).
    pub iv: Iv,
}

/// One handshake attempt over one stream.
pub struct Handshake<'a> {
    role: Role,
    local: Key,
    config: &'a TransportConfig,
    keys: &'a KeyGenerator,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(role: Role, local: Key, config: &'a TransportConfig, keys: &'a KeyGenerator) -> Self {
        Self {
            role,
            local,
            config,
            keys,
            state: HandshakeState::Start,
        }
    }

    pub fn listener(iv: Iv, local: Key, config: &'a TransportConfig, keys: &'a KeyGenerator) -> Self {
        Self::new(Role::Listener { iv }, local, config, keys)
    }

    pub fn dialer(local: Key, config: &'a TransportConfig, keys: &'a KeyGenerator) -> Self {
        Self::new(Role::Dialer, local, config, keys)
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the exchange to completion, bounded by the configured handshake
    /// timeout. Any failure is final; the stream should be dropped.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<HandshakeOutcome, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = self.config.handshake_timeout;
        let attempt = tokio::time::timeout(deadline, self.drive(stream)).await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(TransportError::Handshake {
                step: self.state.step(),
                reason: format!("timed out after {deadline:?}"),
            }),
        };

        match &result {
            Ok(_) => self.state = HandshakeState::Established,
            Err(TransportError::Handshake { step, .. }) => self.state = HandshakeState::Failed(*step),
            Err(_) => self.state = HandshakeState::Failed(self.state.step()),
        }
        result
    }

    async fn drive<S>(&mut self, stream: &mut S) -> Result<HandshakeOutcome, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.role {
            Role::Listener { iv } => self.drive_listener(stream, iv).await,
            Role::Dialer => self.drive_dialer(stream).await,
        }
    }

    async fn drive_listener<S>(&mut self, stream: &mut S, iv: Iv) -> Result<HandshakeOutcome, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // 1/3: offer our identity, the IV and our system port.
        let offer = Message::new(
            self.keys,
            self.local,
            NULL_KEY,
            Payload::Handshake {
                iv: Some(iv),
                system_port: self.config.system_port,
            },
        );
        self.send(stream, &offer, HandshakeStep::Offer).await?;
        self.state = HandshakeState::SentOffer;

        // 2/3: the dialer's identity and system port.
        let reply = self.recv(stream, HandshakeStep::Reply).await?;
        let peer_system_port = match reply.payload() {
            Payload::Handshake { system_port, .. } => *system_port,
            _ => {
                return Err(fail(
                    HandshakeStep::Reply,
                    format!("expected {CMD_HANDSHAKE}, got {}", reply.command()),
                ))
            }
        };
        let peer = self.check_peer(reply.source(), HandshakeStep::Reply)?;

        // 3/3: acknowledge.
        let ack = Message::new(self.keys, self.local, peer, Payload::Ack);
        self.send(stream, &ack, HandshakeStep::Ack).await?;
        self.state = HandshakeState::SentAck;

        Ok(HandshakeOutcome {
            peer,
            peer_system_port,
            iv,
        })
    }

    async fn drive_dialer<S>(&mut self, stream: &mut S) -> Result<HandshakeOutcome, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // 1/3
        self.state = HandshakeState::AwaitOffer;
        let offer = self.recv(stream, HandshakeStep::Offer).await?;
        let (iv, peer_system_port) = match offer.payload() {
            Payload::Handshake {
                iv: Some(iv),
                system_port,
            } => (*iv, *system_port),
            Payload::Handshake { iv: None, .. } => {
                return Err(fail(HandshakeStep::Offer, "offer carries no iv"))
            }
            _ => {
                return Err(fail(
                    HandshakeStep::Offer,
                    format!("expected {CMD_HANDSHAKE}, got {}", offer.command()),
                ))
            }
        };
        let peer = self.check_peer(offer.source(), HandshakeStep::Offer)?;

        // 2/3
        let reply = Message::new(
            self.keys,
            self.local,
            peer,
            Payload::Handshake {
                iv: None,
                system_port: self.config.system_port,
            },
        );
        self.send(stream, &reply, HandshakeStep::Reply).await?;
        self.state = HandshakeState::SentReply;

        // 3/3
        let ack = self.recv(stream, HandshakeStep::Ack).await?;
        if ack.command() != CMD_ACK {
            return Err(fail(
                HandshakeStep::Ack,
                format!("expected {CMD_ACK}, got {}", ack.command()),
            ));
        }
        if ack.source() != peer {
            return Err(fail(
                HandshakeStep::Ack,
                format!("ack from {} but offer from {peer}", ack.source()),
            ));
        }

        Ok(HandshakeOutcome {
            peer,
            peer_system_port,
            iv,
        })
    }

    fn check_peer(&self, peer: Key, step: HandshakeStep) -> Result<Key, TransportError> {
        if peer.is_null() {
            return Err(fail(step, "peer presented the null key"));
        }
        if peer == self.local {
            return Err(fail(step, "peer presented our own key"));
        }
        Ok(peer)
    }

    async fn send<S>(&self, stream: &mut S, msg: &Message, step: HandshakeStep) -> Result<(), TransportError>
    where
        S: AsyncWrite + Unpin,
    {
        framing::write_frame(stream, msg, self.config.max_frame_size)
            .await
            .map_err(|e| fail(step, e.to_string()))
    }

    async fn recv<S>(&self, stream: &mut S, step: HandshakeStep) -> Result<Message, TransportError>
    where
        S: AsyncRead + Unpin,
    {
        framing::read_message(stream, self.config.max_frame_size)
            .await
            .map_err(|e| fail(step, e.to_string()))
    }
}

fn fail(step: HandshakeStep, reason: impl Into<String>) -> TransportError {
    TransportError::Handshake {
        step,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cipher::IV_LEN;

    fn config(port: u16) -> TransportConfig {
        TransportConfig::new().system_port(port)
    }

    #[tokio::test]
    async fn listener_and_dialer_agree() {
        let keys = KeyGenerator::seeded(10);
        let a = keys.generate();
        let b = keys.generate();
        let iv = [9u8; IV_LEN];
        let (mut left, mut right) = tokio::io::duplex(4096);

        let listener_cfg = config(7001);
        let dialer_cfg = config(7002);
        let listener_keys = keys.clone();
        let listener = tokio::spawn(async move {
            let mut hs = Handshake::listener(iv, a, &listener_cfg, &listener_keys);
            let out = hs.run(&mut left).await;
            (out, hs.state())
        });

        let mut hs = Handshake::dialer(b, &dialer_cfg, &keys);
        let dialed = hs.run(&mut right).await.unwrap();
        assert_eq!(hs.state(), HandshakeState::Established);

        let (accepted, state) = listener.await.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(state, HandshakeState::Established);

        assert_eq!(accepted.peer, b);
        assert_eq!(dialed.peer, a);
        assert_eq!(accepted.iv, dialed.iv);
        assert_eq!(accepted.peer_system_port, 7002);
        assert_eq!(dialed.peer_system_port, 7001);
    }

    #[tokio::test]
    async fn dialer_rejects_non_ack() {
        let keys = KeyGenerator::seeded(11);
        let a = keys.generate();
        let b = keys.generate();
        let cfg = config(1);
        let (mut left, mut right) = tokio::io::duplex(4096);

        let fake_keys = keys.clone();
        let fake = tokio::spawn(async move {
            let offer = Message::new(
                &fake_keys,
                a,
                NULL_KEY,
                Payload::Handshake {
                    iv: Some([1u8; IV_LEN]),
                    system_port: 1,
                },
            );
            framing::write_frame(&mut left, &offer, 1024).await.unwrap();
            framing::read_message(&mut left, 1024).await.unwrap();
            let wrong = Message::new(&fake_keys, a, b, Payload::Heartbeat);
            framing::write_frame(&mut left, &wrong, 1024).await.unwrap();
            left
        });

        let mut hs = Handshake::dialer(b, &cfg, &keys);
        let err = hs.run(&mut right).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Handshake {
                step: HandshakeStep::Ack,
                ..
            }
        ));
        assert_eq!(hs.state(), HandshakeState::Failed(HandshakeStep::Ack));
        let _ = fake.await.unwrap();
    }

    #[tokio::test]
    async fn offer_without_iv_is_refused() {
        let keys = KeyGenerator::seeded(12);
        let a = keys.generate();
        let b = keys.generate();
        let cfg = config(1);
        let (mut left, mut right) = tokio::io::duplex(4096);

        let offer = Message::new(
            &keys,
            a,
            NULL_KEY,
            Payload::Handshake {
                iv: None,
                system_port: 1,
            },
        );
        framing::write_frame(&mut left, &offer, 1024).await.unwrap();

        let err = Handshake::dialer(b, &cfg, &keys).run(&mut right).await.unwrap_err();
        match err {
            TransportError::Handshake { step, reason } => {
                assert_eq!(step, HandshakeStep::Offer);
                assert!(reason.contains("iv"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn own_key_is_refused() {
        let keys = KeyGenerator::seeded(13);
        let a = keys.generate();
        let cfg = config(1);
        let (mut left, mut right) = tokio::io::duplex(4096);

        let cfg2 = cfg.clone();
        let keys2 = keys.clone();
        tokio::spawn(async move {
            let _ = Handshake::listener([0u8; IV_LEN], a, &cfg2, &keys2)
                .run(&mut left)
                .await;
        });

        let err = Handshake::dialer(a, &cfg, &keys).run(&mut right).await.unwrap_err();
        assert!(err.to_string().contains("our own key"), "{err}");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let keys = KeyGenerator::seeded(14);
        let cfg = config(1).handshake_timeout(Duration::from_millis(50));
        let (mut left, _right) = tokio::io::duplex(4096);

        let mut hs = Handshake::listener([0u8; IV_LEN], keys.generate(), &cfg, &keys);
        let err = hs.run(&mut left).await.unwrap_err();
        match err {
            TransportError::Handshake { step, reason } => {
                assert_eq!(step, HandshakeStep::Reply);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hs.state(), HandshakeState::Failed(HandshakeStep::Reply));
    }

    #[tokio::test]
    async fn closed_stream_fails_at_offer() {
        let keys = KeyGenerator::seeded(15);
        let cfg = config(1);
        let (mut left, right) = tokio::io::duplex(64);
        drop(right);

        let err = Handshake::dialer(keys.generate(), &cfg, &keys)
            .run(&mut left)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Handshake {
                step: HandshakeStep::Offer,
                ..
            }
        ));
    }
}
