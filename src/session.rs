//! Session orchestrator (C7): owns one engine and one profile, sequences
//! bring-up, and fans classified URCs out to a broadcast channel so any
//! number of presentation layers can subscribe.
//!
//! Events use a closed, typed enum rather than an untyped JSON value — this
//! crate has no HTTP layer serializing events to a browser, so there's no
//! reason to erase the type early.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::error;

use crate::engine::Engine;
use crate::error::ProfileError;
use crate::profile::{NetworkParams, Profile, ProfileKind};
use crate::transport::Transport;

/// Event broadcast capacity. A lagging subscriber drops its oldest buffered
/// events rather than stalling the session — native `broadcast` behavior.
const EVENT_CAPACITY: usize = 256;

/// Something the session wants to tell the outside world. Subscribe via
/// [`Session::subscribe`]; any number of presentation layers may listen.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A human-readable bring-up/teardown status line.
    Status(String),
    /// Network transitioned to a registered or unregistered state.
    Connected(bool),
    /// A parsed signal-quality sample.
    Signal {
        rsrp_dbm: Option<i32>,
        rsrq: Option<i32>,
        sinr: Option<i32>,
        rssi: Option<i32>,
    },
    /// A GNSS fix, decimal degrees as received.
    Location { lat: String, lon: String },
    /// A payload received from the remote endpoint.
    Received {
        source_ip: Ipv4Addr,
        source_port: u16,
        text: String,
    },
    /// A raw `TX:`/`RX:` line, forwarded verbatim for diagnostics.
    RawLog(String),
    /// Bring-up or a live operation failed; the session has returned to a
    /// clean disconnected state.
    Failed(String),
}

enum ConnectedHandle {
    None,
    Some {
        engine: Engine,
        transport: Arc<Transport>,
        bringup: tokio::task::JoinHandle<()>,
    },
}

/// Owns one device connection end to end: transport, engine, profile, and
/// the bring-up task. Cheaply cloneable — internally an `Arc`-backed handle
/// plus a broadcast sender, following the same cloneable-handle shape as
/// [`Engine`].
#[derive(Clone)]
pub struct Session {
    events: broadcast::Sender<SessionEvent>,
    profile: Arc<Mutex<Option<Profile>>>,
    handle: Arc<Mutex<ConnectedHandle>>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            profile: Arc::new(Mutex::new(None)),
            handle: Arc::new(Mutex::new(ConnectedHandle::None)),
        }
    }

    /// Subscribe to session events. Each call gets its own receiver; none of
    /// them affect the others' delivery.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Open the serial device, then run bring-up (connect → network → PDP →
    /// socket → receive wiring → signal subscription) as a background task
    /// so the caller isn't blocked for the full bring-up duration. Bring-up
    /// progress and outcome arrive as [`SessionEvent`]s.
    pub async fn connect(
        &self,
        device: &str,
        baud: u32,
        kind: ProfileKind,
        net: NetworkParams,
    ) -> Result<(), ProfileError> {
        let (transport, lines_rx) = Transport::open(device, baud)
            .map_err(|e| ProfileError::stage("open_transport", e.to_string()))?;
        let transport = Arc::new(transport);
        let engine = Engine::new(TransportSink(transport.clone()), lines_rx);

        let mut raw_rx = transport.subscribe_raw();
        let raw_events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(line) = raw_rx.recv().await {
                let _ = raw_events.send(SessionEvent::RawLog(line));
            }
        });

        self.wire_cereg_status(&engine);

        let this = self.clone();
        let bringup_engine = engine.clone();
        let device_name = device.to_string();
        let bringup = tokio::spawn(async move {
            this.emit(SessionEvent::Status(format!("connecting to {device_name}")));
            if let Err(e) = this.run_bringup(&bringup_engine, kind, &net).await {
                error!("bring-up failed: {e}");
                this.emit(SessionEvent::Failed(e.to_string()));
                this.teardown().await;
                return;
            }
            this.emit(SessionEvent::Status("connected".to_string()));
            this.emit(SessionEvent::Connected(true));
        });

        *self.handle.lock().await = ConnectedHandle::Some {
            engine,
            transport,
            bringup,
        };
        Ok(())
    }

    async fn run_bringup(
        &self,
        engine: &Engine,
        kind: ProfileKind,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        let mut profile = Profile::new(kind);

        self.emit(SessionEvent::Status("probing device".to_string()));
        profile.connect(engine).await?;

        self.emit(SessionEvent::Status("joining network".to_string()));
        profile.init_network(engine, net).await?;

        self.emit(SessionEvent::Status("configuring data context".to_string()));
        profile.configure_pdp(engine, net).await?;

        self.emit(SessionEvent::Status("opening socket".to_string()));
        profile.open_udp(engine, net).await?;
        profile.bind_udp(engine, net.udp_port).await?;

        self.emit(SessionEvent::Status("wiring receive path".to_string()));
        let sink_events = self.events.clone();
        profile
            .setup_receive(
                engine,
                net,
                Arc::new(move |ip, port, text| {
                    let _ = sink_events.send(SessionEvent::Received {
                        source_ip: ip,
                        source_port: port,
                        text,
                    });
                }),
            )
            .await?;

        self.emit(SessionEvent::Status("subscribing to signal reports".to_string()));
        profile.subscribe_signal(engine).await?;

        self.wire_signal_urcs(engine, &profile);
        if let Some(fix) = profile.location() {
            self.emit(SessionEvent::Location {
                lat: fix.lat,
                lon: fix.lon,
            });
        }

        *self.profile.lock().await = Some(profile);
        Ok(())
    }

    /// Subscribe to `+CEREG:` so a mid-session registration transition is
    /// reported without tearing the session down (a timeout during live
    /// operation tears down; a bare state transition does not).
    fn wire_cereg_status(&self, engine: &Engine) {
        let profile = self.profile.clone();
        let events = self.events.clone();
        engine.urc().subscribe("+CEREG:", move |line| {
            let profile = profile.clone();
            let events = events.clone();
            let line = line.to_string();
            tokio::spawn(async move {
                let guard = profile.lock().await;
                let Some(active) = guard.as_ref() else { return };
                if let Some(status) = active.parse_cereg_urc(&line) {
                    let _ = events.send(SessionEvent::Connected(status.is_registered()));
                }
            });
        });
    }

    fn wire_signal_urcs(&self, engine: &Engine, profile: &Profile) {
        let events = self.events.clone();
        let kind = profile.identify().family_tag;
        let prefix = if kind == "nordic_thingy91x" { "%CESQ:" } else { "%MEAS:" };
        let profile_snapshot = profile_kind_of(kind);
        engine.urc().subscribe(prefix, move |line| {
            if let Some(sample) = parse_signal(profile_snapshot, line) {
                let _ = events.send(SessionEvent::Signal {
                    rsrp_dbm: sample.rsrp_dbm,
                    rsrq: sample.rsrq,
                    sinr: sample.sinr,
                    rssi: sample.rssi,
                });
            }
        });
    }

    /// Send a payload through the active profile.
    pub async fn send(&self, text: &str) -> Result<(), ProfileError> {
        let handle = self.handle.lock().await;
        let ConnectedHandle::Some { engine, .. } = &*handle else {
            return Err(ProfileError::ProtocolState("not connected".to_string()));
        };
        let mut profile_guard = self.profile.lock().await;
        let Some(profile) = profile_guard.as_mut() else {
            return Err(ProfileError::ProtocolState("bring-up not complete".to_string()));
        };
        profile.send_payload(engine, text).await
    }

    /// Tear the session down: stop the transport's reader thread and drop
    /// engine/profile state. Idempotent.
    pub async fn disconnect(&self) {
        self.emit(SessionEvent::Status("disconnecting".to_string()));
        self.teardown().await;
        self.emit(SessionEvent::Status("disconnected".to_string()));
        self.emit(SessionEvent::Connected(false));
    }

    async fn teardown(&self) {
        let mut handle = self.handle.lock().await;
        if let ConnectedHandle::Some { transport, bringup, .. } =
            std::mem::replace(&mut *handle, ConnectedHandle::None)
        {
            bringup.abort();
            transport.close().await;
        }
        *self.profile.lock().await = None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn profile_kind_of(family_tag: &'static str) -> ProfileKind {
    if family_tag == "nordic_thingy91x" {
        ProfileKind::LteM
    } else {
        ProfileKind::Ntn
    }
}

fn parse_signal(kind: ProfileKind, line: &str) -> Option<crate::profile::SignalSample> {
    match kind {
        ProfileKind::LteM => crate::profile::LteMProfile::parse_signal_urc(line),
        ProfileKind::Ntn => crate::profile::NtnProfile::parse_signal_urc(line),
    }
}

/// Adapts [`Transport`] to [`crate::engine::LineSink`] via a shared handle so
/// the session can also keep its own `Arc<Transport>` for `close()`/raw-tap.
struct TransportSink(Arc<Transport>);

impl crate::engine::LineSink for TransportSink {
    fn write_line(&self, text: &str) -> Result<(), crate::error::EngineError> {
        self.0.write_line(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_kind_of() {
        assert_eq!(profile_kind_of("nordic_thingy91x"), ProfileKind::LteM);
        assert_eq!(profile_kind_of("murata_type1sc_ntng"), ProfileKind::Ntn);
    }

    #[test]
    fn test_session_starts_disconnected() {
        let session = Session::new();
        let mut rx = session.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_protocol_state_error() {
        let session = Session::new();
        let err = session.send("hello").await.unwrap_err();
        assert!(matches!(err, ProfileError::ProtocolState(_)));
    }
}
