//! Device profile interface (C4): the capability set every supported modem
//! family exposes, plus the shared data types profiles parse URCs into.
//!
//! The profile set is closed — exactly two families are supported — so this
//! is a tagged variant ([`Profile`]) over two heterogeneous structs rather
//! than a dynamic class hierarchy: Profile B carries GNSS-fix and
//! sticky-location-sent state that has no counterpart on Profile A. Each
//! variant's inherent methods implement the same capability set; `Profile`
//! just matches and delegates, so callers never need `dyn`.

pub mod lte_m;
pub mod ntn;

use std::net::Ipv4Addr;
use std::time::Duration;

pub use lte_m::LteMProfile;
pub use ntn::NtnProfile;

use crate::engine::Engine;
use crate::error::ProfileError;

/// Received payload sink: `(source ip, source port, decoded text)`.
pub type ReceiveSink = std::sync::Arc<dyn Fn(Ipv4Addr, u16, String) + Send + Sync>;

/// Device identity returned by `identify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: &'static str,
    pub manufacturer: &'static str,
    pub family_tag: &'static str,
}

/// Parsed `+CEREG:` registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub stat: u32,
}

impl RegistrationStatus {
    #[must_use]
    pub fn is_registered(&self) -> bool {
        matches!(self.stat, 1 | 5)
    }
}

/// A signal-quality sample. Fields a profile cannot report are left `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSample {
    pub rsrp_dbm: Option<i32>,
    pub rsrq: Option<i32>,
    pub sinr: Option<i32>,
    pub rssi: Option<i32>,
}

/// A GNSS fix, decimal degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub lat: String,
    pub lon: String,
}

/// Network-facing configuration a profile needs during bring-up; distinct
/// from [`crate::config::Config`] so profiles don't depend on the on-disk
/// shape.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub udp_port: u16,
    pub harvest_endpoint: String,
    pub harvest_port: u16,
    pub udp_buffer_size: usize,
    pub ip_filter: Ipv4Addr,
    pub ntn_band: String,
}

/// Standard deadline for a presence/config command that is expected to
/// reply promptly.
pub(crate) const SHORT: Duration = Duration::from_secs(10);

/// Which device family to bring up. Selected from config (`[profile].kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    LteM,
    Ntn,
}

/// The closed set of device profiles (C4), as a tagged variant rather than a
/// `dyn` trait — see module docs.
pub enum Profile {
    LteM(LteMProfile),
    Ntn(NtnProfile),
}

impl Profile {
    #[must_use]
    pub fn new(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::LteM => Profile::LteM(LteMProfile::new()),
            ProfileKind::Ntn => Profile::Ntn(NtnProfile::new()),
        }
    }

    #[must_use]
    pub fn identify(&self) -> DeviceIdentity {
        match self {
            Profile::LteM(p) => p.identify(),
            Profile::Ntn(p) => p.identify(),
        }
    }

    pub async fn connect(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.connect(engine).await,
            Profile::Ntn(p) => p.connect(engine).await,
        }
    }

    pub async fn init_network(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.init_network(engine, net).await,
            Profile::Ntn(p) => p.init_network(engine, net).await,
        }
    }

    pub async fn configure_pdp(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.configure_pdp(engine, net).await,
            Profile::Ntn(p) => p.configure_pdp(engine, net).await,
        }
    }

    pub async fn open_udp(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.open_udp(engine, net).await,
            Profile::Ntn(p) => p.open_udp(engine, net).await,
        }
    }

    pub async fn bind_udp(&mut self, engine: &Engine, port: u16) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.bind_udp(engine, port).await,
            Profile::Ntn(p) => p.bind_udp(engine, port).await,
        }
    }

    pub async fn setup_receive(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
        sink: ReceiveSink,
    ) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.setup_receive(engine, net, sink).await,
            Profile::Ntn(p) => p.setup_receive(engine, net, sink).await,
        }
    }

    pub async fn subscribe_signal(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.subscribe_signal(engine).await,
            Profile::Ntn(p) => p.subscribe_signal(engine).await,
        }
    }

    #[must_use]
    pub fn parse_signal_urc(&self, line: &str) -> Option<SignalSample> {
        match self {
            Profile::LteM(_) => LteMProfile::parse_signal_urc(line),
            Profile::Ntn(_) => NtnProfile::parse_signal_urc(line),
        }
    }

    #[must_use]
    pub fn parse_cereg_urc(&self, line: &str) -> Option<RegistrationStatus> {
        match self {
            Profile::LteM(_) => LteMProfile::parse_cereg_urc(line),
            Profile::Ntn(_) => NtnProfile::parse_cereg_urc(line),
        }
    }

    pub async fn send_payload(&mut self, engine: &Engine, text: &str) -> Result<(), ProfileError> {
        match self {
            Profile::LteM(p) => p.send_payload(engine, text).await,
            Profile::Ntn(p) => p.send_payload(engine, text).await,
        }
    }

    #[must_use]
    pub fn location(&self) -> Option<Fix> {
        match self {
            Profile::LteM(p) => p.location(),
            Profile::Ntn(p) => p.location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_status() {
        assert!(RegistrationStatus { stat: 1 }.is_registered());
        assert!(RegistrationStatus { stat: 5 }.is_registered());
        assert!(!RegistrationStatus { stat: 0 }.is_registered());
        assert!(!RegistrationStatus { stat: 2 }.is_registered());
    }
}
