//! Device connection state machine.
//!
//! ```text
//! Disconnected --connect()--> Connecting --link up--> Connected
//! Connected --link down / decode error--> Reconnecting --backoff--> Connecting
//! any --user_disconnect()--> Disconnected (no automatic reconnect)
//! ```
//!
//! One supervisor task owns the link. While connected it runs a single session loop that
//! reads and frames device output, is the only writer to the stream, and sends periodic
//! heartbeats. Everything the bridge needs to know about the link arrives as
//! [`LinkEvent`]s in order.
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use super::framer::{self, Frame, FrameBuffer, FrameError};
use super::link::{Connector, DeviceStream};
use crate::config::DeviceConfig;
use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not connected (state: {0:?})")]
    NotConnected(ConnectionState),
    #[error("device link closed before the frame was written")]
    LinkClosed,
    #[error("request cancelled: device disconnected by user")]
    Disconnected,
    #[error("device write failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Exponential reconnect delay: `min * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exp = (self.failures - 1).min(31);
        self.min.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub heartbeat: Option<Duration>,
}

impl From<&DeviceConfig> for TransportSettings {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            reconnect_min: Duration::from_millis(cfg.reconnect_min_ms),
            reconnect_max: Duration::from_millis(cfg.reconnect_max_ms),
            heartbeat: (cfg.heartbeat_secs > 0).then(|| Duration::from_secs(cfg.heartbeat_secs)),
        }
    }
}

/// Link notifications, tagged with the connection generation they belong to.
#[derive(Debug)]
pub enum LinkEvent {
    Up {
        generation: u64,
    },
    Frame {
        generation: u64,
        frame: Frame<proto::FromRadio>,
    },
    /// The device answered our `want_config_id`; emitted at most once per generation.
    CaptureComplete {
        generation: u64,
    },
    Down {
        generation: u64,
        error: Option<String>,
    },
}

#[derive(Debug)]
enum ControlMessage {
    Shutdown,
    Reconnect,
}

struct WriteRequest {
    frame: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    settings: TransportSettings,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
    writer: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("Transport state {:?} -> {:?}", prev, state);
        }
    }

    fn record_error(&self, msg: String) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(msg);
        }
    }

    fn set_writer(&self, writer: Option<mpsc::Sender<WriteRequest>>) {
        if let Ok(mut guard) = self.writer.lock() {
            *guard = writer;
        }
    }
}

struct Supervisor {
    control: mpsc::UnboundedSender<ControlMessage>,
    task: JoinHandle<()>,
}

struct Inner {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

/// Cloneable handle to the device connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: TransportSettings,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            connector,
            settings,
            state_tx,
            last_error: Mutex::new(None),
            writer: Mutex::new(None),
            events,
            generation: AtomicU64::new(0),
        });
        let transport = Transport {
            inner: Arc::new(Inner {
                shared,
                supervisor: tokio::sync::Mutex::new(None),
            }),
        };
        (transport, events_rx)
    }

    /// Start the supervisor if it is not already running.
    pub async fn connect(&self) {
        let mut guard = self.inner.supervisor.lock().await;
        if let Some(sup) = guard.as_ref() {
            if !sup.task.is_finished() {
                return;
            }
        }
        let (control, control_rx) = mpsc::unbounded_channel();
        let shared = self.inner.shared.clone();
        shared.set_state(ConnectionState::Connecting);
        info!("Connecting to device at {}", shared.connector.describe());
        let task = tokio::spawn(supervise(shared, control_rx));
        *guard = Some(Supervisor { control, task });
    }

    /// Close the link and stop reconnecting. Returns once the supervisor has exited.
    pub async fn user_disconnect(&self) {
        let sup = self.inner.supervisor.lock().await.take();
        if let Some(sup) = sup {
            let _ = sup.control.send(ControlMessage::Shutdown);
            if let Err(e) = sup.task.await {
                warn!("Transport supervisor ended abnormally: {}", e);
            }
        }
        self.inner.shared.set_writer(None);
        self.inner.shared.set_state(ConnectionState::Disconnected);
    }

    /// Drop the current link (if any) and reconnect immediately with a fresh backoff.
    pub async fn user_reconnect(&self) {
        {
            let guard = self.inner.supervisor.lock().await;
            if let Some(sup) = guard.as_ref() {
                if !sup.task.is_finished() && sup.control.send(ControlMessage::Reconnect).is_ok() {
                    return;
                }
            }
        }
        self.connect().await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .shared
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    /// Generation of the most recent link-up (0 before the first connection).
    pub fn generation(&self) -> u64 {
        self.inner.shared.generation.load(Ordering::SeqCst)
    }

    pub fn describe(&self) -> String {
        self.inner.shared.connector.describe()
    }

    /// Frame and write one message. Resolves once the bytes are on the link.
    pub async fn send(&self, message: &proto::ToRadio) -> Result<(), TransportError> {
        let writer = self
            .inner
            .shared
            .writer
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| TransportError::NotConnected(self.state()))?;
        let frame = framer::encode(message)?;
        let (done, done_rx) = oneshot::channel();
        writer
            .send(WriteRequest { frame, done })
            .await
            .map_err(|_| TransportError::LinkClosed)?;
        done_rx.await.map_err(|_| TransportError::LinkClosed)??;
        Ok(())
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
    Lost(String),
}

async fn supervise(shared: Arc<Shared>, mut control_rx: mpsc::UnboundedReceiver<ControlMessage>) {
    let mut backoff = Backoff::new(shared.settings.reconnect_min, shared.settings.reconnect_max);
    'outer: loop {
        shared.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            r = timeout(shared.settings.connect_timeout, shared.connector.open()) => r,
            ctl = control_rx.recv() => match ctl {
                Some(ControlMessage::Reconnect) => {
                    backoff.reset();
                    continue;
                }
                Some(ControlMessage::Shutdown) | None => break,
            },
        };

        let failure = match opened {
            Ok(Ok(stream)) => {
                backoff.reset();
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let end = run_session(&shared, stream, generation, &mut control_rx).await;
                shared.set_writer(None);
                let error = match &end {
                    SessionEnd::Lost(e) => Some(e.clone()),
                    _ => None,
                };
                let _ = shared.events.send(LinkEvent::Down { generation, error });
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Reconnect => {
                        info!("Reconnect requested; reopening device link");
                        metrics::inc_reconnects();
                        continue;
                    }
                    SessionEnd::Lost(e) => {
                        warn!("Device link lost: {}", e);
                        metrics::inc_reconnects();
                        e
                    }
                }
            }
            Ok(Err(e)) => format!("failed to open {}: {}", shared.connector.describe(), e),
            Err(_) => format!(
                "timed out after {:?} opening {}",
                shared.settings.connect_timeout,
                shared.connector.describe()
            ),
        };

        shared.record_error(failure.clone());
        shared.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        warn!(
            "{} (attempt {}); retrying in {}ms",
            failure,
            backoff.failures(),
            delay.as_millis()
        );
        loop {
            tokio::select! {
                _ = sleep(delay) => break,
                ctl = control_rx.recv() => match ctl {
                    Some(ControlMessage::Reconnect) => {
                        backoff.reset();
                        break;
                    }
                    Some(ControlMessage::Shutdown) | None => break 'outer,
                },
            }
        }
    }
    shared.set_writer(None);
    shared.set_state(ConnectionState::Disconnected);
    info!("Transport supervisor stopped");
}

async fn run_session(
    shared: &Shared,
    stream: DeviceStream,
    generation: u64,
    control_rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
) -> SessionEnd {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (write_tx, mut write_rx) = mpsc::channel::<WriteRequest>(64);
    shared.set_writer(Some(write_tx));
    shared.set_state(ConnectionState::Connected);
    info!(
        "Device link up ({}, generation {})",
        shared.connector.describe(),
        generation
    );
    let _ = shared.events.send(LinkEvent::Up { generation });

    let mut config_id: u32 = rand::random();
    if config_id == 0 {
        config_id = 1;
    }
    info!(
        "Requesting config from radio (want_config_id=0x{:08x})",
        config_id
    );
    let want_config = proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(config_id)),
    };
    if let Err(e) = write_message(&mut writer, &want_config).await {
        return SessionEnd::Lost(format!("want_config write failed: {}", e));
    }

    let heartbeat_every = shared.settings.heartbeat.unwrap_or(Duration::from_secs(3600));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut framer = FrameBuffer::new();
    let mut buf = [0u8; 1024];
    let mut captured = false;

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => return SessionEnd::Lost("device closed the connection".into()),
                    Ok(n) => n,
                    Err(e) => return SessionEnd::Lost(format!("read failed: {}", e)),
                };
                framer.push(&buf[..n]);
                loop {
                    match framer.next_frame::<proto::FromRadio>() {
                        Ok(Some(frame)) => {
                            metrics::inc_frames_rx();
                            let complete = matches!(
                                frame.message.payload_variant,
                                Some(proto::from_radio::PayloadVariant::ConfigCompleteId(id)) if id == config_id
                            );
                            let _ = shared.events.send(LinkEvent::Frame { generation, frame });
                            if complete && !captured {
                                captured = true;
                                info!("Config capture complete (generation {})", generation);
                                let _ = shared.events.send(LinkEvent::CaptureComplete { generation });
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            metrics::inc_decode_errors();
                            error!("Protocol decode error from device: {}", e);
                            return SessionEnd::Lost(format!("protocol decode error: {}", e));
                        }
                    }
                }
            }
            req = write_rx.recv() => {
                let Some(req) = req else {
                    return SessionEnd::Lost("writer queue closed".into());
                };
                let result = write_frame(&mut writer, &req.frame).await;
                let failure = result.as_ref().err().map(|e| e.to_string());
                let _ = req.done.send(result);
                if let Some(e) = failure {
                    return SessionEnd::Lost(format!("write failed: {}", e));
                }
            }
            _ = heartbeat.tick(), if shared.settings.heartbeat.is_some() => {
                let nonce = rand::random::<u32>() & 0xffff;
                let hb = proto::ToRadio {
                    payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat { nonce })),
                };
                if let Err(e) = write_message(&mut writer, &hb).await {
                    return SessionEnd::Lost(format!("heartbeat write failed: {}", e));
                }
                debug!("Heartbeat sent (nonce={})", nonce);
            }
            ctl = control_rx.recv() => match ctl {
                Some(ControlMessage::Reconnect) => return SessionEnd::Reconnect,
                Some(ControlMessage::Shutdown) | None => {
                    let bye = proto::ToRadio {
                        payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
                    };
                    let _ = write_message(&mut writer, &bye).await;
                    let _ = writer.shutdown().await;
                    info!("Device link closed by user");
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &proto::ToRadio,
) -> io::Result<()> {
    let frame = framer::encode(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &frame).await
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    metrics::inc_frames_tx();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u128> = (0..6).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(b.failures(), 6);
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_secs(5));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn backoff_survives_many_failures() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(b.next_delay() <= Duration::from_secs(60));
        }
    }

    #[test]
    fn settings_disable_heartbeat_at_zero() {
        let mut cfg = crate::config::Config::default().device;
        cfg.heartbeat_secs = 0;
        assert!(TransportSettings::from(&cfg).heartbeat.is_none());
    }
}
