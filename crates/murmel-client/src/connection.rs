//! The connection: TLS control channel, opportunistic UDP voice channel,
//! pings, and the task plumbing between them.
//!
//! Task layout per established connection: a reader draining control
//! frames into the router, a writer serializing outbound frames, a UDP
//! receive loop, a voice send loop (UDP or tunnel fallback), and a
//! housekeeping/ping timer. The model task outlives re-establishment so
//! observers keep working across a certificate-override reconnect.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, trace, warn};

use murmel_audio::config::AudioConfig;
use murmel_audio::mixer::Mixer;
use murmel_audio::speech::{Speaker, TalkState};
use murmel_crypto::{CryptState, CryptStats};
use murmel_proto::control::{self, ControlMessage};
use murmel_proto::framing::try_decode_frame;
use murmel_proto::version::{PROTOCOL_VERSION, RELEASE};
use murmel_proto::voice;

use crate::config::ConnectConfig;
use crate::error::ClientError;
use crate::events::ModelObserver;
use crate::model::{run_model, ModelInput, ServerModel};
use crate::router::{self, RouteAction};
use crate::stats::TimingStats;
use crate::verify::{AcceptingVerifier, CapturingVerifier, CapturedChain};

/// Control-channel ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// UDP counts as available while a ping reply is younger than this
/// (2 × ping interval).
const UDP_TIMEOUT: Duration = Duration::from_secs(10);

/// CELT bitstream versions advertised in Authenticate.
const CELT_ALPHA_VERSION: i32 = 0x8000_000bu32 as i32;
const CELT_BETA_VERSION: i32 = 0x8000_0010u32 as i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    TlsHandshake,
    /// Transport up, authentication sent, ServerSync pending.
    Opened,
    /// ServerSync received; the model is live.
    Authenticated,
    /// Certificate verification failed; only reconnect or disconnect are
    /// valid from here.
    TrustFailure,
    Disconnecting,
    Closed,
}

#[derive(Clone)]
pub(crate) struct UdpLink {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) target: SocketAddr,
}

/// Parameters for speakers created on first voice packet.
#[derive(Clone, Copy)]
pub(crate) struct SpeakerParams {
    pub(crate) jitter_packets: usize,
    pub(crate) reserve_packets: usize,
    pub(crate) comfort_noise: Option<f32>,
}

impl SpeakerParams {
    fn from_audio(audio: &AudioConfig) -> Self {
        let frames = (audio.jitter_buffer_ms / u32::from(murmel_audio::FRAME_MILLIS)).max(2);
        Self {
            jitter_packets: frames as usize,
            reserve_packets: 2 + audio.output_delay_frames as usize,
            comfort_noise: audio
                .enable_comfort_noise
                .then_some(audio.comfort_noise_level),
        }
    }
}

/// State shared between the connection handle and its tasks.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    pub(crate) crypt: Mutex<CryptState>,
    pub(crate) mixer: Arc<Mixer>,
    pub(crate) speaker_params: SpeakerParams,
    pub(crate) model_tx: mpsc::UnboundedSender<ModelInput>,
    control_tx: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
    pub(crate) udp: Mutex<Option<UdpLink>>,
    pub(crate) udp_available: AtomicBool,
    pub(crate) force_tcp: AtomicBool,
    pub(crate) last_udp_pong: Mutex<Option<Instant>>,
    pub(crate) tcp_ping: Mutex<TimingStats>,
    pub(crate) udp_ping: Mutex<TimingStats>,
    pub(crate) tcp_packets: AtomicU32,
    pub(crate) udp_packets: AtomicU32,
    /// Own session id, learned from ServerSync.
    pub(crate) session: AtomicU32,
    peer_chain: Mutex<Option<Vec<CertificateDer<'static>>>>,
    /// Last talk state surfaced per session, to only report edges.
    pub(crate) talk_seen: Mutex<HashMap<u32, TalkState>>,
    /// Sessions whose audio is dropped before decode. Survives reconnects.
    pub(crate) local_mutes: Mutex<HashSet<u32>>,
}

impl Shared {
    pub(crate) fn new(
        model_tx: mpsc::UnboundedSender<ModelInput>,
        mixer: Arc<Mixer>,
        audio: &AudioConfig,
    ) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            crypt: Mutex::new(CryptState::new()),
            mixer,
            speaker_params: SpeakerParams::from_audio(audio),
            model_tx,
            control_tx: Mutex::new(None),
            udp: Mutex::new(None),
            udp_available: AtomicBool::new(false),
            force_tcp: AtomicBool::new(audio.force_tcp),
            last_udp_pong: Mutex::new(None),
            tcp_ping: Mutex::new(TimingStats::default()),
            udp_ping: Mutex::new(TimingStats::default()),
            tcp_packets: AtomicU32::new(0),
            udp_packets: AtomicU32::new(0),
            session: AtomicU32::new(0),
            peer_chain: Mutex::new(None),
            talk_seen: Mutex::new(HashMap::new()),
            local_mutes: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.lock();
        if *state != new {
            debug!(from = ?*state, to = ?new, "connection state");
            *state = new;
        }
    }

    /// Enqueue a control message on the writer; dropped when no writer is
    /// live (e.g. mid-reconnect).
    pub(crate) fn send_control(&self, msg: ControlMessage) {
        if let Some(tx) = self.control_tx.lock().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Mark the transport closed exactly once and tell observers.
    pub(crate) fn note_closed(&self, error: Option<String>) {
        {
            let mut state = self.state.lock();
            if matches!(
                *state,
                ConnectionState::Closed | ConnectionState::Disconnecting
            ) {
                return;
            }
            *state = ConnectionState::Closed;
        }
        *self.control_tx.lock() = None;
        let _ = self.model_tx.send(ModelInput::Closed(error));
    }

    /// Route one decrypted (or tunneled) datagram to the audio path.
    pub(crate) fn dispatch_voice(&self, data: &[u8], via_udp: bool) {
        match voice::decode(data, true) {
            Ok(voice::UdpPacket::Ping { timestamp }) => {
                if via_udp {
                    let rtt_ms = now_micros().saturating_sub(timestamp) as f64 / 1000.0;
                    self.udp_ping.lock().record(rtt_ms);
                    *self.last_udp_pong.lock() = Some(Instant::now());
                    if !self.udp_available.swap(true, Ordering::Relaxed) {
                        info!("udp channel available");
                        let _ = self.model_tx.send(ModelInput::UdpAvailable(true));
                    }
                }
            }
            Ok(voice::UdpPacket::Voice(datagram)) => {
                let Some(session) = datagram.session else {
                    return;
                };
                if self.local_mutes.lock().contains(&session) {
                    return;
                }
                let speaker = self.mixer.speaker(session).unwrap_or_else(|| {
                    let params = self.speaker_params;
                    let speaker = Arc::new(Speaker::new(
                        session,
                        params.jitter_packets,
                        params.reserve_packets,
                        params.comfort_noise,
                    ));
                    self.mixer.insert_speaker(speaker.clone());
                    speaker
                });
                let talk = speaker.enqueue(datagram);
                let mut seen = self.talk_seen.lock();
                if seen.get(&session) != Some(&talk) {
                    seen.insert(session, talk);
                    let _ = self
                        .model_tx
                        .send(ModelInput::TalkStates(vec![(session, talk)]));
                }
            }
            Err(error) => debug!(%error, "undecodable voice datagram"),
        }
    }

    pub(crate) fn store_peer_chain(&self, chain: Vec<CertificateDer<'static>>) {
        *self.peer_chain.lock() = Some(chain);
    }

    /// Install a capture channel in place of the writer task.
    #[cfg(test)]
    pub(crate) fn attach_test_writer(&self) -> mpsc::UnboundedReceiver<ControlMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.control_tx.lock() = Some(tx);
        rx
    }
}

pub struct Connection {
    config: Mutex<ConnectConfig>,
    audio: AudioConfig,
    shared: Arc<Shared>,
    model_tx: mpsc::UnboundedSender<ModelInput>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    voice_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    _model_task: JoinHandle<()>,
    _forward_task: JoinHandle<()>,
}

impl Connection {
    /// Create the connection and try to establish it.
    ///
    /// A certificate trust failure does NOT fail this call: the returned
    /// connection sits in [`ConnectionState::TrustFailure`], observers got
    /// `trust_failure`, and the caller may `set_ignore_verification(true)`
    /// and `reconnect`. All other establishment errors are returned.
    pub async fn connect(
        config: ConnectConfig,
        audio: AudioConfig,
        observers: Vec<Box<dyn ModelObserver>>,
    ) -> Result<Self, ClientError> {
        let mixer = Arc::new(Mixer::new(audio.volume, audio.sidetone_volume));
        let (model_tx, model_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        let mut model = ServerModel::new(outbound_tx);
        for observer in observers {
            model.add_observer(observer);
        }
        let model_task = tokio::spawn(run_model(model, model_rx));

        let shared = Arc::new(Shared::new(model_tx.clone(), mixer, &audio));

        // Messages the model wants to send (blob requests) go through
        // whatever writer is currently live.
        let forward_shared = shared.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                forward_shared.send_control(msg);
            }
        });

        let connection = Self {
            config: Mutex::new(config),
            audio,
            shared,
            model_tx,
            tasks: Mutex::new(Vec::new()),
            voice_tx: Mutex::new(None),
            _model_task: model_task,
            _forward_task: forward_task,
        };

        match connection.establish().await {
            Ok(()) => Ok(connection),
            Err(ClientError::TrustFailure) => Ok(connection),
            Err(other) => Err(other),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn mixer(&self) -> Arc<Mixer> {
        self.shared.mixer.clone()
    }

    pub fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }

    /// Our session id once authenticated.
    pub fn session(&self) -> Option<u32> {
        match self.shared.session.load(Ordering::Relaxed) {
            0 => None,
            s => Some(s),
        }
    }

    pub fn crypt_stats(&self) -> CryptStats {
        *self.shared.crypt.lock().stats()
    }

    pub fn udp_available(&self) -> bool {
        self.shared.udp_available.load(Ordering::Relaxed)
    }

    /// The certificate chain the server presented (DER, leaf first).
    pub fn peer_chain(&self) -> Option<Vec<Vec<u8>>> {
        self.shared
            .peer_chain
            .lock()
            .as_ref()
            .map(|chain| chain.iter().map(|c| c.as_ref().to_vec()).collect())
    }

    /// Allow the next `reconnect` to proceed past certificate failures.
    pub fn set_ignore_verification(&self, ignore: bool) {
        self.config.lock().ignore_verification = ignore;
    }

    /// Register another observer; it starts receiving callbacks in order
    /// with everything dispatched after this call.
    pub fn add_observer(&self, observer: Box<dyn ModelObserver>) {
        let _ = self.model_tx.send(ModelInput::AddObserver(observer));
    }

    /// Send a control message.
    pub fn send_message(&self, msg: ControlMessage) {
        self.shared.send_control(msg);
    }

    /// Sender for plaintext voice datagrams from the input pipeline; the
    /// connection encrypts and picks UDP or the tunnel.
    pub fn voice_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.voice_tx.lock().clone()
    }

    /// Ask the server to move us into `channel_id`.
    pub fn join_channel(&self, channel_id: u32) {
        let session = self.shared.session.load(Ordering::Relaxed);
        if session == 0 {
            warn!("join_channel before ServerSync");
            return;
        }
        self.send_message(ControlMessage::UserState(control::UserState {
            session: Some(session),
            channel_id: Some(channel_id),
            ..Default::default()
        }));
    }

    /// Publish our self-mute/deafen state.
    pub fn set_self_mute_deaf(&self, mute: bool, deaf: bool) {
        let session = self.shared.session.load(Ordering::Relaxed);
        self.send_message(ControlMessage::UserState(control::UserState {
            session: (session != 0).then_some(session),
            self_mute: Some(mute),
            self_deaf: Some(deaf),
            ..Default::default()
        }));
    }

    /// Locally mute a user: their datagrams are dropped before decode and
    /// the model records the flag. Nothing is sent to the server.
    pub fn set_local_mute(&self, session: u32, muted: bool) {
        {
            let mut mutes = self.shared.local_mutes.lock();
            if muted {
                mutes.insert(session);
            } else {
                mutes.remove(&session);
            }
        }
        if muted {
            self.shared.mixer.remove_speaker(session);
        }
        let _ = self
            .model_tx
            .send(ModelInput::SetLocalMute { session, muted });
    }

    /// Mark a user as a friend; a client-side annotation only.
    pub fn set_friend(&self, session: u32, friend: bool) {
        let _ = self.model_tx.send(ModelInput::SetFriend { session, friend });
    }

    /// Send a text message to channels and/or users.
    pub fn send_text_message(&self, channels: &[u32], sessions: &[u32], text: &str) {
        self.send_message(ControlMessage::TextMessage(control::TextMessage {
            actor: None,
            session: sessions.to_vec(),
            channel_id: channels.to_vec(),
            tree_id: Vec::new(),
            message: text.to_owned(),
        }));
    }

    /// Register a whisper/shout target in slot `id` (1..=30).
    pub fn set_voice_target(&self, id: u32, targets: Vec<control::VoiceTargetEntry>) {
        self.send_message(ControlMessage::VoiceTarget(control::VoiceTarget {
            id: Some(id),
            targets,
        }));
    }

    /// Re-establish after a trust failure or close.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::TrustFailure
            | ConnectionState::Closed
            | ConnectionState::Disconnected => {}
            _ => return Err(ClientError::InvalidState("reconnect")),
        }
        self.teardown();
        self.establish().await
    }

    /// Close the transport. Observers get `connection_closed(None)`.
    pub fn disconnect(&self) {
        self.shared.set_state(ConnectionState::Disconnecting);
        self.teardown();
        self.shared.set_state(ConnectionState::Closed);
        let _ = self.model_tx.send(ModelInput::Closed(None));
    }

    fn teardown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.shared.control_tx.lock() = None;
        *self.voice_tx.lock() = None;
        *self.shared.udp.lock() = None;
        self.shared.udp_available.store(false, Ordering::Relaxed);
        *self.shared.last_udp_pong.lock() = None;
        self.shared.mixer.clear();
        self.shared.talk_seen.lock().clear();
    }

    /// Dial, handshake, authenticate, and spawn the per-connection tasks.
    async fn establish(&self) -> Result<(), ClientError> {
        let config = self.config.lock().clone();
        let shared = self.shared.clone();

        shared.set_state(ConnectionState::Connecting);
        let tcp = match config.connect_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, TcpStream::connect((&*config.host, config.port)))
                    .await
                    .map_err(|_| ClientError::ConnectTimeout)??
            }
            None => TcpStream::connect((&*config.host, config.port)).await?,
        };
        let _ = tcp.set_nodelay(true);
        info!(host = %config.host, port = config.port, "tcp connected");

        shared.set_state(ConnectionState::TlsHandshake);
        let captured: CapturedChain = Arc::new(Mutex::new(None));
        let verifier: Arc<dyn ServerCertVerifier> = if config.ignore_verification {
            warn!("certificate verification disabled by caller override");
            Arc::new(AcceptingVerifier::new(captured.clone()))
        } else {
            Arc::new(CapturingVerifier::new(captured.clone())?)
        };

        let builder = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let tls_config = match config.identity.as_ref() {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())?,
            None => builder.with_no_client_auth(),
        };

        let server_name = if let Ok(ip) = config.host.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(config.host.clone())
                .map_err(|_| ClientError::InvalidServerName(config.host.clone()))?
        };

        let connector = TlsConnector::from(Arc::new(tls_config));
        let tls = match connector.connect(server_name, tcp).await {
            Ok(stream) => stream,
            Err(error) => {
                let cert_rejected = error
                    .get_ref()
                    .and_then(|inner| inner.downcast_ref::<rustls::Error>())
                    .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)));
                let chain = captured.lock().take();
                if cert_rejected {
                    if let Some(chain) = chain {
                        warn!(%error, "certificate verification failed");
                        shared.store_peer_chain(chain.clone());
                        shared.set_state(ConnectionState::TrustFailure);
                        let der: Vec<Vec<u8>> =
                            chain.iter().map(|c| c.as_ref().to_vec()).collect();
                        let _ = self.model_tx.send(ModelInput::TrustFailure(der));
                        return Err(ClientError::TrustFailure);
                    }
                }
                shared.set_state(ConnectionState::Closed);
                return Err(error.into());
            }
        };
        info!("tls handshake complete");

        if let Some(certs) = tls.get_ref().1.peer_certificates() {
            shared.store_peer_chain(certs.iter().map(|c| c.clone().into_owned()).collect());
        }

        let (read_half, write_half) = tokio::io::split(tls);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *shared.control_tx.lock() = Some(control_tx.clone());

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(writer_task(
            write_half,
            control_rx,
            shared.clone(),
        )));

        // Version then Authenticate, in that order, before anything else.
        let _ = control_tx.send(ControlMessage::Version(control::Version {
            version: Some(PROTOCOL_VERSION),
            release: Some(RELEASE.to_owned()),
            os: Some(std::env::consts::OS.to_owned()),
            os_version: None,
        }));
        let _ = control_tx.send(ControlMessage::Authenticate(control::Authenticate {
            username: Some(config.username.clone()),
            password: config.password.clone(),
            tokens: config.tokens.clone(),
            celt_versions: vec![CELT_ALPHA_VERSION, CELT_BETA_VERSION],
            opus: Some(true),
        }));

        if !shared.force_tcp.load(Ordering::Relaxed) {
            match open_udp(&config.host, config.port).await {
                Ok(link) => {
                    info!(target = %link.target, "udp socket ready");
                    *shared.udp.lock() = Some(link.clone());
                    tasks.push(tokio::spawn(udp_receive_task(link, shared.clone())));
                }
                Err(error) => {
                    warn!(%error, "udp socket unavailable, voice will tunnel");
                }
            }
        }

        tasks.push(tokio::spawn(reader_task(read_half, shared.clone())));
        tasks.push(tokio::spawn(ping_task(shared.clone())));

        let (voice_tx, voice_rx) = mpsc::channel(256);
        *self.voice_tx.lock() = Some(voice_tx);
        tasks.push(tokio::spawn(voice_send_task(voice_rx, shared.clone())));

        {
            let mut slot = self.tasks.lock();
            for task in slot.drain(..) {
                task.abort();
            }
            *slot = tasks;
        }

        shared.set_state(ConnectionState::Opened);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // The model and forwarder wait on each other's channels; stop them
        // explicitly so a dropped handle leaks nothing.
        self._model_task.abort();
        self._forward_task.abort();
    }
}

async fn open_udp(host: &str, port: u16) -> Result<UdpLink, std::io::Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let target = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        })?;
    socket.connect(target).await?;
    Ok(UdpLink {
        socket: Arc::new(socket),
        target,
    })
}

/// Serializes every outbound frame; the single writer keeps frame bytes
/// from interleaving.
async fn writer_task(
    mut write_half: WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::UnboundedReceiver<ControlMessage>,
    shared: Arc<Shared>,
) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg.encode_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to encode control frame");
                continue;
            }
        };
        if let Err(error) = write_half.write_all(&frame).await {
            error!(%error, "control write failed");
            shared.note_closed(Some(error.to_string()));
            break;
        }
        shared.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reads and routes control frames until the stream ends or framing
/// breaks (which is fatal).
async fn reader_task(mut read_half: ReadHalf<TlsStream<TcpStream>>, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some((kind, payload))) => match router::route(kind, payload, &shared) {
                    RouteAction::Continue => {}
                    RouteAction::Close => {
                        shared.note_closed(None);
                        return;
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    error!(%error, "control framing corrupt");
                    shared.note_closed(Some(error.to_string()));
                    return;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                shared.note_closed(Some("connection reset by server".into()));
                return;
            }
            Ok(_) => {}
            Err(error) => {
                shared.note_closed(Some(error.to_string()));
                return;
            }
        }
    }
}

/// Receives, decrypts and dispatches UDP datagrams.
async fn udp_receive_task(link: UdpLink, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 1500];
    loop {
        let len = match link.socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(error) => {
                warn!(%error, "udp receive failed");
                return;
            }
        };
        let plain = { shared.crypt.lock().decrypt(&buf[..len]) };
        match plain {
            Ok(plain) => {
                shared.udp_packets.fetch_add(1, Ordering::Relaxed);
                shared.dispatch_voice(&plain, true);
            }
            // Counted in the crypt statistics; nothing else to do.
            Err(error) => trace!(%error, "udp datagram rejected"),
        }
    }
}

/// Encrypts and transmits voice, falling back to the TLS tunnel whenever
/// UDP is unavailable or disabled.
async fn voice_send_task(mut rx: mpsc::Receiver<Vec<u8>>, shared: Arc<Shared>) {
    while let Some(plain) = rx.recv().await {
        let use_udp = shared.udp_available.load(Ordering::Relaxed)
            && !shared.force_tcp.load(Ordering::Relaxed);
        if use_udp {
            let link = shared.udp.lock().clone();
            if let Some(link) = link {
                let packet = { shared.crypt.lock().encrypt(&plain) };
                match packet {
                    Ok(packet) => {
                        if let Err(error) = link.socket.send(&packet).await {
                            warn!(%error, "udp send failed, tunneling");
                            shared.send_control(ControlMessage::UdpTunnel(Bytes::from(plain)));
                        }
                        continue;
                    }
                    Err(error) => {
                        // Refused plaintext (weak block) is dropped whole.
                        debug!(%error, "voice encrypt refused");
                        continue;
                    }
                }
            }
        }
        shared.send_control(ControlMessage::UdpTunnel(Bytes::from(plain)));
    }
}

/// Housekeeping: talk-state sweep every second, protocol pings every 5 s,
/// UDP availability tracking.
async fn ping_task(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tick = 0u64;
    loop {
        interval.tick().await;
        tick += 1;

        // Surface Passive transitions the enqueue path cannot see, and
        // retire drained speakers; the next datagram recreates them.
        let states = shared.mixer.talk_states();
        let mut changed = Vec::new();
        {
            let mut seen = shared.talk_seen.lock();
            for (session, talk) in states {
                if seen.get(&session) != Some(&talk) {
                    seen.insert(session, talk);
                    changed.push((session, talk));
                    if talk == TalkState::Passive {
                        shared.mixer.remove_speaker(session);
                    }
                }
            }
        }
        if !changed.is_empty() {
            let _ = shared.model_tx.send(ModelInput::TalkStates(changed));
        }

        if tick % PING_INTERVAL.as_secs() != 0 {
            continue;
        }

        let timestamp = now_micros();
        let stats = { *shared.crypt.lock().stats() };
        let (tcp_avg, tcp_var) = {
            let t = shared.tcp_ping.lock();
            (t.mean(), t.variance())
        };
        let (udp_avg, udp_var) = {
            let t = shared.udp_ping.lock();
            (t.mean(), t.variance())
        };
        shared.send_control(ControlMessage::Ping(control::Ping {
            timestamp: Some(timestamp),
            good: Some(stats.good),
            late: Some(stats.late),
            lost: Some(stats.lost),
            resync: Some(stats.resync),
            udp_packets: Some(shared.udp_packets.load(Ordering::Relaxed)),
            tcp_packets: Some(shared.tcp_packets.load(Ordering::Relaxed)),
            udp_ping_avg: Some(udp_avg),
            udp_ping_var: Some(udp_var),
            tcp_ping_avg: Some(tcp_avg),
            tcp_ping_var: Some(tcp_var),
        }));

        let keyed = shared.crypt.lock().is_keyed();
        let force_tcp = shared.force_tcp.load(Ordering::Relaxed);
        if keyed && !force_tcp {
            let link = shared.udp.lock().clone();
            if let Some(link) = link {
                let packet = { shared.crypt.lock().encrypt(&voice::encode_ping(timestamp)) };
                if let Ok(packet) = packet {
                    if let Err(error) = link.socket.send(&packet).await {
                        warn!(%error, "udp ping send failed");
                    }
                }
            }
        }

        // Availability: a reply within 2 × ping interval keeps UDP on.
        let fresh = shared
            .last_udp_pong
            .lock()
            .is_some_and(|at| at.elapsed() < UDP_TIMEOUT);
        let available = fresh && !force_tcp;
        if !available && shared.udp_available.swap(false, Ordering::Relaxed) {
            info!("udp channel lost, tunneling voice");
            let _ = shared.model_tx.send(ModelInput::UdpAvailable(false));
        }
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_stream_in_order_and_intact() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, mut client_write) = tokio::io::split(client);
        drop(client_read);

        let messages = vec![
            ControlMessage::Ping(control::Ping {
                timestamp: Some(1),
                ..Default::default()
            }),
            ControlMessage::UdpTunnel(Bytes::from_static(&[0x80, 1, 2, 3])),
            ControlMessage::TextMessage(control::TextMessage {
                actor: Some(4),
                session: vec![],
                channel_id: vec![0],
                tree_id: vec![],
                message: "hello".into(),
            }),
        ];
        for msg in &messages {
            client_write
                .write_all(&msg.encode_frame().unwrap())
                .await
                .unwrap();
        }
        drop(client_write);

        let (mut server_read, _server_write) = tokio::io::split(server);
        let mut buf = BytesMut::new();
        let mut received = Vec::new();
        loop {
            while let Some((kind, payload)) = try_decode_frame(&mut buf).unwrap() {
                received.push(ControlMessage::decode(kind, payload).unwrap().unwrap());
            }
            match server_read.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => panic!("{e}"),
            }
        }

        assert_eq!(received.len(), 3);
        assert!(matches!(
            &received[0],
            ControlMessage::Ping(p) if p.timestamp == Some(1)
        ));
        assert!(matches!(
            &received[1],
            ControlMessage::UdpTunnel(raw) if raw[..] == [0x80, 1, 2, 3]
        ));
        assert!(matches!(
            &received[2],
            ControlMessage::TextMessage(t) if t.message == "hello"
        ));
    }

    #[test]
    fn speaker_params_derive_from_audio_config() {
        let mut audio = AudioConfig::default();
        audio.jitter_buffer_ms = 100;
        audio.output_delay_frames = 3;
        audio.enable_comfort_noise = true;
        let params = SpeakerParams::from_audio(&audio);
        assert_eq!(params.jitter_packets, 10);
        assert_eq!(params.reserve_packets, 5);
        assert!(params.comfort_noise.is_some());
    }

    #[test]
    fn version_constants_pack() {
        assert_eq!(CELT_ALPHA_VERSION as u32, 0x8000_000b);
        assert_eq!(PROTOCOL_VERSION >> 16, 1);
    }

    #[test]
    fn udp_ping_echoes_through_the_crypt_channel() {
        // Both ends keyed as CryptSetup would leave them.
        let key = [0x5Au8; 16];
        let mut client_nonce = [0u8; 16];
        client_nonce[0] = 0x01;
        client_nonce[1] = 0x30;
        let mut server_nonce = [0u8; 16];
        server_nonce[0] = 0x02;
        server_nonce[1] = 0x40;

        let mut client = CryptState::new();
        client.set_key(key, client_nonce, server_nonce);
        let mut server = CryptState::new();
        server.set_key(key, server_nonce, client_nonce);

        let timestamp = 0x0123_4567_89AB_CDEF;
        let packet = client.encrypt(&voice::encode_ping(timestamp)).unwrap();
        let plain = server.decrypt(&packet).unwrap();
        match voice::decode(&plain, false).unwrap() {
            voice::UdpPacket::Ping { timestamp: t } => assert_eq!(t, timestamp),
            other => panic!("{other:?}"),
        }

        // The echo decrypts cleanly and carries the same timestamp.
        let reply = server.encrypt(&plain).unwrap();
        let echoed = client.decrypt(&reply).unwrap();
        match voice::decode(&echoed, true).unwrap() {
            voice::UdpPacket::Ping { timestamp: t } => assert_eq!(t, timestamp),
            other => panic!("{other:?}"),
        }
        assert_eq!(client.stats().good, 1);
    }
}
