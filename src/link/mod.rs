//! Persistent control-plane link.
//!
//! One long-lived task owns the connection and never gives up on it:
//! dial, authenticate, serve, and on any failure tear down and re-dial
//! after an exponential backoff with jitter. While connected, the read
//! loop and write loop run as independent halves of the transport; each
//! inbound envelope is handled on its own task so one slow handler never
//! stalls subsequent reads.
//!
//! The rest of the system talks to the link through [`LinkHandle`]:
//! `send` for fire-and-forget events and `call` for blocking RPC with
//! correlation-id matching.

pub mod correlation;
pub mod protocol;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{DepotError, Result};
use crate::registry::FileRegistry;
use correlation::CorrelationTable;
use protocol::{payload, Envelope, Payload, Route, CLIENT_NAME};
use router::MessageRouter;

/// Outbound queue depth. Senders await free space, so a wedged connection
/// applies backpressure instead of buffering without bound; the write loop
/// is the single drain point, which keeps sends ordered per connection.
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Interval between keepalive pings while connected. Idle-connection
/// timeouts at intermediaries are typically 60s; 15s keeps well under that.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// First reconnect delay after a connection failure.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Reconnect delay cap.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default deadline for a `call` awaiting its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for the peer to close after our `bye`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// LinkHandle
// =============================================================================

/// Cloneable handle for sending envelopes over the live connection.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<Envelope>,
    correlation: Arc<CorrelationTable>,
}

impl LinkHandle {
    pub fn new(outbound: mpsc::Sender<Envelope>, correlation: Arc<CorrelationTable>) -> Self {
        Self {
            outbound,
            correlation,
        }
    }

    /// Fire-and-forget delivery into the outbound queue.
    ///
    /// Ordered relative to other sends on the same connection. Fails only
    /// when the link manager itself has stopped.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| DepotError::LinkLost)
    }

    /// Blocking RPC with the default timeout.
    pub async fn call(&self, route: Route, data: Payload) -> Result<Payload> {
        self.call_with_timeout(route, data, DEFAULT_CALL_TIMEOUT).await
    }

    /// Blocking RPC: register a waiting slot, send the request, await the
    /// correlated response.
    ///
    /// The slot is registered before the request is transmitted so an
    /// immediate reply cannot race past us. On timeout the slot is removed
    /// and the caller gets `CallTimeout`; if the connection drops first,
    /// the abandoned slot surfaces as `LinkLost`.
    pub async fn call_with_timeout(
        &self,
        route: Route,
        data: Payload,
        timeout: Duration,
    ) -> Result<Payload> {
        let correlation_id = Uuid::new_v4().to_string();
        let slot = self.correlation.register(&correlation_id);

        let request = Envelope::request(route, correlation_id.clone(), data);
        if let Err(err) = self.send(request).await {
            self.correlation.remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DepotError::LinkLost),
            Err(_) => {
                self.correlation.remove(&correlation_id);
                Err(DepotError::CallTimeout { route, timeout })
            }
        }
    }
}

// =============================================================================
// LinkManager
// =============================================================================

/// How a connection session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Transport failure; the manager will reconnect.
    Lost,
    /// External shutdown signal; the manager stops.
    Shutdown,
}

pub struct LinkManager {
    config: Arc<Config>,
    correlation: Arc<CorrelationTable>,
    router: MessageRouter,
    registry: Arc<FileRegistry>,
    outbound: mpsc::Receiver<Envelope>,
    tls: Arc<rustls::ClientConfig>,
}

impl LinkManager {
    pub fn new(
        config: Arc<Config>,
        correlation: Arc<CorrelationTable>,
        router: MessageRouter,
        registry: Arc<FileRegistry>,
        outbound: mpsc::Receiver<Envelope>,
    ) -> Self {
        let tls = tls_client_config(config.is_development());
        Self {
            config,
            correlation,
            router,
            registry,
            outbound,
            tls,
        }
    }

    /// Drive the connection until shutdown. Never gives up: every failure
    /// schedules another attempt on the [`Backoff`] schedule. Exactly one
    /// attempt is in flight at a time, and a failed session is fully torn
    /// down (pending calls abandoned) before the next dial.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect().await {
                Ok(stream) => {
                    info!(host = %self.config.control_host, "connected to control plane");
                    backoff.reset();

                    if self.run_session(stream, &mut shutdown).await == SessionEnd::Shutdown {
                        break;
                    }
                }
                Err(err) => {
                    warn!(host = %self.config.control_host, error = %err, "dial failed");
                }
            }

            let abandoned = self.correlation.abandon_all();
            if abandoned > 0 {
                debug!(abandoned, "abandoned pending calls on connection loss");
            }

            let wait = backoff.next_wait();
            debug!(?wait, "scheduling reconnect");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("link manager stopped");
    }

    /// Dial the control plane and complete the TLS handshake.
    async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let host = self.config.control_host.clone();
        let tcp = TcpStream::connect((host.as_str(), self.config.control_port)).await?;

        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| DepotError::InvalidHost(host))?;
        let connector = TlsConnector::from(self.tls.clone());
        let stream = connector.connect(server_name, tcp).await?;
        Ok(stream)
    }

    /// Serve one established connection until it fails or shutdown is
    /// signalled. Pending calls are abandoned before this returns, so a
    /// new session never inherits stale waiters.
    ///
    /// Public so embedders and tests can drive an already-established
    /// transport (anything `AsyncRead + AsyncWrite`) through the full
    /// session protocol.
    pub async fn run_session<S>(
        &mut self,
        stream: S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let end = self.serve(stream, shutdown).await;
        let abandoned = self.correlation.abandon_all();
        if abandoned > 0 {
            debug!(abandoned, "abandoned pending calls at session end");
        }
        end
    }

    async fn serve<S>(&mut self, stream: S, shutdown: &mut watch::Receiver<bool>) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        // Authenticate before anything else: bearer token plus a fixed
        // client identifier, as the first frame on the wire.
        let hello = Envelope::event(
            Route::Hello,
            payload([
                ("token", serde_json::Value::String(self.config.control_token.clone())),
                ("client", serde_json::Value::String(CLIENT_NAME.to_string())),
            ]),
        );
        if write_envelope(&mut write_half, &hello).await.is_err() {
            return SessionEnd::Lost;
        }

        // The control plane expects a capacity report on every (re)connect.
        self.registry.send_disk_usage().await;

        // Read loop: one task per inbound envelope. Dropping `_done` when
        // the loop exits signals the write side below.
        let router = self.router.clone();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            let _done = done_tx;
            loop {
                let raw = match protocol::read_frame(&mut read_half).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        debug!(error = %err, "read loop ending");
                        break;
                    }
                };
                match Envelope::decode(&raw) {
                    Ok(envelope) => {
                        let router = router.clone();
                        tokio::spawn(async move { router.route(envelope).await });
                    }
                    Err(err) => warn!(error = %err, "dropping undecodable envelope"),
                }
            }
        });

        // First keepalive fires one interval after connect, not immediately.
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        let end = loop {
            tokio::select! {
                _ = &mut done_rx => break SessionEnd::Lost,

                _ = keepalive.tick() => {
                    let ping = Envelope::event(Route::Ping, Payload::new());
                    if write_envelope(&mut write_half, &ping).await.is_err() {
                        break SessionEnd::Lost;
                    }
                }

                maybe = self.outbound.recv() => match maybe {
                    Some(envelope) => {
                        if let Err(err) = write_envelope(&mut write_half, &envelope).await {
                            warn!(route = %envelope.route, error = %err, "write failed");
                            break SessionEnd::Lost;
                        }
                    }
                    // Every handle dropped; nothing left to serve.
                    None => break SessionEnd::Shutdown,
                },

                changed = shutdown.changed() => {
                    if changed.is_ok() && !*shutdown.borrow() {
                        continue;
                    }
                    let bye = Envelope::event(Route::Bye, Payload::new());
                    let _ = write_envelope(&mut write_half, &bye).await;
                    // Give the peer a moment to acknowledge by closing.
                    let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut done_rx).await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        reader.abort();
        end
    }
}

async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let frame = envelope.encode()?;
    protocol::write_frame(writer, &frame).await
}

/// Reconnect schedule: exponential backoff from [`RECONNECT_BASE_DELAY`]
/// doubling up to [`RECONNECT_MAX_DELAY`], jittered per attempt, reset to
/// the base after a successful connect.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: RECONNECT_BASE_DELAY,
        }
    }

    fn reset(&mut self) {
        self.delay = RECONNECT_BASE_DELAY;
    }

    /// Jittered wait for the next attempt, advancing the schedule.
    fn next_wait(&mut self) -> Duration {
        let wait = jittered(self.delay);
        self.delay = (self.delay * 2).min(RECONNECT_MAX_DELAY);
        wait
    }
}

/// Apply +/-50% jitter so a fleet of sidecars does not reconnect in phase.
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    delay.mul_f64(factor)
}

fn tls_client_config(development: bool) -> Arc<rustls::ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = if development {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification(
                rustls::crypto::ring::default_provider(),
            )))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Arc::new(config)
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any server certificate. Installed only in development mode,
    /// where the control plane runs with a self-signed cert.
    #[derive(Debug)]
    pub(super) struct NoVerification(pub(super) CryptoProvider);

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
