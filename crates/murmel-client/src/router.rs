//! Inbound control-message routing.
//!
//! A few messages belong to the transport itself: CryptSetup keys the UDP
//! channel, Ping replies update round-trip and remote-loss bookkeeping,
//! and UDPTunnel injects its payload into the voice receive path. Every
//! other known message is forwarded to the model task in arrival order;
//! unknown types are logged and dropped, and a payload that fails to
//! decode drops that one message without closing the connection.

use bytes::Bytes;
use tracing::{debug, info, warn};

use murmel_crypto::KEY_SIZE;
use murmel_proto::control::{self, ControlMessage};

use crate::connection::{now_micros, ConnectionState, Shared};
use crate::model::ModelInput;

/// What the reader loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteAction {
    Continue,
    /// A Reject arrived; the connection closes after it is surfaced.
    Close,
}

pub(crate) fn route(raw_kind: u16, payload: Bytes, shared: &Shared) -> RouteAction {
    let msg = match ControlMessage::decode(raw_kind, payload) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            warn!(kind = raw_kind, "unknown control message type, dropping");
            return RouteAction::Continue;
        }
        Err(error) => {
            // Malformed body inside an intact frame: drop just the message.
            warn!(kind = raw_kind, %error, "undecodable control message");
            return RouteAction::Continue;
        }
    };

    match msg {
        ControlMessage::CryptSetup(setup) => {
            handle_crypt_setup(setup, shared);
            RouteAction::Continue
        }
        ControlMessage::Ping(ping) => {
            handle_ping_reply(ping, shared);
            RouteAction::Continue
        }
        ControlMessage::UdpTunnel(datagram) => {
            // Tunneled datagrams ride inside TLS and are not OCB2-wrapped.
            shared.dispatch_voice(&datagram, false);
            RouteAction::Continue
        }
        ControlMessage::ServerSync(sync) => {
            if let Some(session) = sync.session {
                shared
                    .session
                    .store(session, std::sync::atomic::Ordering::Relaxed);
            }
            shared.set_state(ConnectionState::Authenticated);
            let _ = shared
                .model_tx
                .send(ModelInput::Control(ControlMessage::ServerSync(sync)));
            RouteAction::Continue
        }
        ControlMessage::Reject(reject) => {
            info!(kind = ?reject.kind(), reason = reject.reason.as_deref().unwrap_or(""), "server rejected connection");
            let _ = shared
                .model_tx
                .send(ModelInput::Control(ControlMessage::Reject(reject)));
            RouteAction::Close
        }
        ControlMessage::Version(version) => {
            debug!(
                version = version.version.unwrap_or(0),
                release = version.release.as_deref().unwrap_or(""),
                "server version"
            );
            RouteAction::Continue
        }
        other => {
            let _ = shared.model_tx.send(ModelInput::Control(other));
            RouteAction::Continue
        }
    }
}

/// CryptSetup: full keying, a decrypt-nonce resync, or (bare) a request to
/// report our current encrypt nonce back.
fn handle_crypt_setup(setup: control::CryptSetup, shared: &Shared) {
    let key = fixed::<KEY_SIZE>(setup.key.as_deref());
    let client_nonce = fixed::<KEY_SIZE>(setup.client_nonce.as_deref());
    let server_nonce = fixed::<KEY_SIZE>(setup.server_nonce.as_deref());

    match (key, client_nonce, server_nonce) {
        (Some(key), Some(client_nonce), Some(server_nonce)) => {
            let mut crypt = shared.crypt.lock();
            crypt.set_key(key, client_nonce, server_nonce);
            info!("udp crypto keyed");
        }
        (None, None, Some(server_nonce)) => {
            let mut crypt = shared.crypt.lock();
            crypt.set_decrypt_nonce(server_nonce);
            debug!("decrypt nonce resynchronized");
        }
        _ => {
            // The server wants our send nonce to resynchronize its side.
            let nonce = shared.crypt.lock().encrypt_nonce();
            shared.send_control(ControlMessage::CryptSetup(control::CryptSetup {
                key: None,
                client_nonce: Some(nonce.to_vec()),
                server_nonce: None,
            }));
        }
    }
}

/// A Ping echo: fold the timestamp into the TCP round-trip stats and
/// record what the server reported about its receive side.
fn handle_ping_reply(ping: control::Ping, shared: &Shared) {
    if let Some(timestamp) = ping.timestamp {
        let rtt_ms = now_micros().saturating_sub(timestamp) as f64 / 1000.0;
        shared.tcp_ping.lock().record(rtt_ms);
    }
    shared.crypt.lock().set_remote_stats(
        ping.good.unwrap_or(0),
        ping.late.unwrap_or(0),
        ping.lost.unwrap_or(0),
        ping.resync.unwrap_or(0),
    );
}

fn fixed<const N: usize>(bytes: Option<&[u8]>) -> Option<[u8; N]> {
    match bytes {
        Some(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            Some(out)
        }
        Some(bytes) => {
            warn!(len = bytes.len(), expected = N, "crypt field with bad length");
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use prost::Message;
    use tokio::sync::mpsc;

    use murmel_audio::config::AudioConfig;
    use murmel_audio::mixer::Mixer;
    use murmel_proto::framing::MessageKind;
    use murmel_proto::voice::{encode_voice, VoiceDatagram, VoicePayload};

    struct Harness {
        shared: Arc<Shared>,
        model_rx: mpsc::UnboundedReceiver<ModelInput>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    }

    fn harness() -> Harness {
        let (model_tx, model_rx) = mpsc::unbounded_channel();
        let mixer = Arc::new(Mixer::new(1.0, 0.0));
        let shared = Arc::new(Shared::new(model_tx, mixer, &AudioConfig::default()));
        let control_rx = shared.attach_test_writer();
        Harness {
            shared,
            model_rx,
            control_rx,
        }
    }

    fn encode_payload(msg: &ControlMessage) -> (u16, Bytes) {
        let frame = msg.encode_frame().unwrap();
        let kind = u16::from_be_bytes([frame[0], frame[1]]);
        (kind, Bytes::copy_from_slice(&frame[6..]))
    }

    #[test]
    fn full_crypt_setup_keys_the_channel() {
        let h = harness();
        let (kind, payload) = encode_payload(&ControlMessage::CryptSetup(control::CryptSetup {
            key: Some(vec![0u8; 16]),
            client_nonce: Some(vec![1u8; 16]),
            server_nonce: Some(vec![2u8; 16]),
        }));
        assert_eq!(route(kind, payload, &h.shared), RouteAction::Continue);
        assert!(h.shared.crypt.lock().is_keyed());
    }

    #[test]
    fn bare_client_nonce_requests_echo() {
        let mut h = harness();
        {
            let mut crypt = h.shared.crypt.lock();
            crypt.set_key([0u8; 16], [7u8; 16], [8u8; 16]);
        }
        let (kind, payload) = encode_payload(&ControlMessage::CryptSetup(control::CryptSetup {
            key: None,
            client_nonce: Some(vec![9u8; 16]),
            server_nonce: None,
        }));
        route(kind, payload, &h.shared);

        match h.control_rx.try_recv() {
            Ok(ControlMessage::CryptSetup(reply)) => {
                assert_eq!(reply.client_nonce.as_deref(), Some(&[7u8; 16][..]));
                assert!(reply.key.is_none());
                assert!(reply.server_nonce.is_none());
            }
            other => panic!("expected CryptSetup reply, got {other:?}"),
        }
    }

    #[test]
    fn server_nonce_resyncs_decrypt_iv() {
        let h = harness();
        {
            let mut crypt = h.shared.crypt.lock();
            crypt.set_key([0u8; 16], [7u8; 16], [8u8; 16]);
        }
        let (kind, payload) = encode_payload(&ControlMessage::CryptSetup(control::CryptSetup {
            key: None,
            client_nonce: None,
            server_nonce: Some(vec![3u8; 16]),
        }));
        route(kind, payload, &h.shared);
        assert_eq!(h.shared.crypt.lock().stats().resync, 1);
    }

    #[test]
    fn ping_reply_records_remote_stats() {
        let h = harness();
        let (kind, payload) = encode_payload(&ControlMessage::Ping(control::Ping {
            timestamp: Some(now_micros()),
            good: Some(11),
            late: Some(2),
            lost: Some(3),
            resync: Some(1),
            ..Default::default()
        }));
        route(kind, payload, &h.shared);
        let crypt = h.shared.crypt.lock();
        assert_eq!(crypt.stats().remote_good, 11);
        assert_eq!(crypt.stats().remote_lost, 3);
        assert_eq!(h.shared.tcp_ping.lock().count(), 1);
    }

    #[test]
    fn tunneled_voice_reaches_the_mixer() {
        let mut h = harness();
        let datagram = encode_voice(&VoiceDatagram {
            target: 0,
            session: Some(55),
            sequence: 0,
            payload: VoicePayload::Opus {
                frame: Bytes::from_static(&[1, 2, 3]),
                terminator: false,
            },
            position: None,
        });
        let (kind, payload) =
            encode_payload(&ControlMessage::UdpTunnel(Bytes::from(datagram)));
        assert_eq!(route(kind, payload, &h.shared), RouteAction::Continue);

        assert!(h.shared.mixer.speaker(55).is_some());
        match h.model_rx.try_recv() {
            Ok(ModelInput::TalkStates(states)) => {
                assert_eq!(states[0].0, 55);
            }
            _ => panic!("expected a talk-state edge"),
        }
    }

    #[test]
    fn locally_muted_session_is_dropped_before_decode() {
        let mut h = harness();
        h.shared.local_mutes.lock().insert(55);

        let datagram = encode_voice(&VoiceDatagram {
            target: 0,
            session: Some(55),
            sequence: 0,
            payload: VoicePayload::Opus {
                frame: Bytes::from_static(&[1, 2, 3]),
                terminator: false,
            },
            position: None,
        });
        let (kind, payload) =
            encode_payload(&ControlMessage::UdpTunnel(Bytes::from(datagram)));
        route(kind, payload, &h.shared);

        assert!(h.shared.mixer.speaker(55).is_none());
        assert!(h.model_rx.try_recv().is_err());
    }

    #[test]
    fn server_sync_flips_state_and_forwards() {
        let mut h = harness();
        let (kind, payload) = encode_payload(&ControlMessage::ServerSync(control::ServerSync {
            session: Some(42),
            ..Default::default()
        }));
        route(kind, payload, &h.shared);
        assert_eq!(h.shared.state(), ConnectionState::Authenticated);
        assert_eq!(h.shared.session.load(Ordering::Relaxed), 42);
        assert!(matches!(
            h.model_rx.try_recv(),
            Ok(ModelInput::Control(ControlMessage::ServerSync(_)))
        ));
    }

    #[test]
    fn reject_closes_after_forwarding() {
        let mut h = harness();
        let (kind, payload) = encode_payload(&ControlMessage::Reject(control::Reject {
            kind: Some(control::RejectKind::ServerFull as i32),
            reason: Some("full".into()),
        }));
        assert_eq!(route(kind, payload, &h.shared), RouteAction::Close);
        assert!(matches!(
            h.model_rx.try_recv(),
            Ok(ModelInput::Control(ControlMessage::Reject(_)))
        ));
    }

    #[test]
    fn unknown_kind_is_dropped() {
        let h = harness();
        assert_eq!(
            route(0x4242, Bytes::from_static(b"junk"), &h.shared),
            RouteAction::Continue
        );
    }

    #[test]
    fn malformed_body_is_dropped_without_closing() {
        let h = harness();
        // A truncated/garbage protobuf body for a known kind.
        let garbage = control::UserState::default().encode_to_vec();
        let mut bad = garbage;
        bad.push(0xFF); // dangling field header
        assert_eq!(
            route(MessageKind::UserState as u16, Bytes::from(bad), &h.shared),
            RouteAction::Continue
        );
    }
}
