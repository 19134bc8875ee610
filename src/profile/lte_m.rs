//! Profile A — terrestrial LTE-M (Nordic Thingy:91 X-style AT shell
//! firmware). Bring-up is a short, fixed six-step sequence; send/receive
//! framing is plain text, not hex.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, DEFAULT_FINAL};
use crate::error::ProfileError;

use super::{DeviceIdentity, Fix, NetworkParams, ReceiveSink, RegistrationStatus, SignalSample, SHORT};

const PRESENCE_DEADLINE: Duration = Duration::from_secs(5);
const REGISTRATION_DEADLINE: Duration = Duration::from_secs(120);
const SEND_DEADLINE: Duration = Duration::from_secs(30);

pub struct LteMProfile {
    recv_ip_filter: Ipv4Addr,
    recv_buffer_size: usize,
    harvest_endpoint: String,
    harvest_port: u16,
}

impl LteMProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recv_ip_filter: Ipv4Addr::new(100, 127, 10, 16),
            recv_buffer_size: 256,
            harvest_endpoint: "harvest.soracom.io".to_string(),
            harvest_port: 8514,
        }
    }

    #[must_use]
    pub fn identify(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: "Nordic Thingy:91 X",
            manufacturer: "Nordic Semiconductor",
            family_tag: "nordic_thingy91x",
        }
    }

    pub async fn connect(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        let (ok, _) = engine.send_command("AT", DEFAULT_FINAL, PRESENCE_DEADLINE).await?;
        if !ok {
            return Err(ProfileError::stage("connect", "no response to AT"));
        }
        Ok(())
    }

    pub async fn init_network(
        &mut self,
        engine: &Engine,
        _net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        let steps: &[&str] = &[
            "AT+CFUN=0",
            "AT+CEREG=5",
            "AT+CSCON=1",
            "AT%XSYSTEMMODE=1,0,1,0",
            "AT+CFUN=1",
        ];
        for cmd in steps {
            let (ok, _) = engine.send_command(cmd, DEFAULT_FINAL, SHORT).await?;
            if !ok {
                return Err(ProfileError::stage("init_network", format!("{cmd} failed")));
            }
        }

        let (ok, line) = engine.wait_for_urc("+CEREG:", REGISTRATION_DEADLINE).await;
        if !ok {
            return Err(ProfileError::stage("init_network", "registration timeout"));
        }
        let line = line.unwrap_or_default();
        match Self::parse_cereg_urc(&line) {
            Some(status) if status.is_registered() => Ok(()),
            _ => Err(ProfileError::stage(
                "init_network",
                format!("not registered: {line}"),
            )),
        }
    }

    pub async fn configure_pdp(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        self.harvest_endpoint = net.harvest_endpoint.clone();
        self.harvest_port = net.harvest_port;

        let (ok, _) = engine
            .send_command(r#"AT+CGDCONT=1,"IP","soracom.io""#, DEFAULT_FINAL, SHORT)
            .await?;
        if !ok {
            return Err(ProfileError::stage("configure_pdp", "PDP context rejected"));
        }
        Ok(())
    }

    pub async fn open_udp(
        &mut self,
        engine: &Engine,
        _net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        let (ok, _) = engine.send_command("AT#XSOCKET=1,2,0", DEFAULT_FINAL, SHORT).await?;
        if !ok {
            return Err(ProfileError::stage("open_udp", "socket open rejected"));
        }
        Ok(())
    }

    pub async fn bind_udp(&mut self, engine: &Engine, port: u16) -> Result<(), ProfileError> {
        let (ok, _) = engine
            .send_command(&format!("AT#XBIND={port}"), DEFAULT_FINAL, SHORT)
            .await?;
        if !ok {
            return Err(ProfileError::stage("bind_udp", "bind rejected"));
        }
        Ok(())
    }

    pub async fn setup_receive(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
        sink: ReceiveSink,
    ) -> Result<(), ProfileError> {
        self.recv_ip_filter = net.ip_filter;
        self.recv_buffer_size = net.udp_buffer_size;

        let ip_filter = net.ip_filter;
        let buffer_size = net.udp_buffer_size;
        // URC handlers run synchronously on the reader thread and must not
        // block on engine progress — spawn the read as a short-lived worker.
        let engine = engine.clone();
        engine.clone().urc().subscribe("+CSCON: 1", move |_line| {
            let engine = engine.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Some((ip, port, payload)) =
                    receive_udp(&engine, buffer_size, ip_filter).await
                {
                    sink(ip, port, payload);
                }
            });
        });
        Ok(())
    }

    pub async fn subscribe_signal(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        let (ok, _) = engine.send_command("AT%CESQ=1", DEFAULT_FINAL, SHORT).await?;
        if !ok {
            return Err(ProfileError::stage("subscribe_signal", "rejected"));
        }
        Ok(())
    }

    #[must_use]
    pub fn parse_signal_urc(line: &str) -> Option<SignalSample> {
        let rest = line.strip_prefix("%CESQ:")?.trim();
        let mut fields = rest.split(',').map(str::trim);
        let rsrp_raw: i32 = fields.next()?.parse().ok()?;
        let rsrq: i32 = fields.next()?.parse().ok()?;
        let snr: i32 = fields.next()?.parse().ok()?;
        let _rscp: i32 = fields.next()?.parse().ok()?;
        let rsrp_dbm = if rsrp_raw != 255 {
            Some(rsrp_raw - 141)
        } else {
            None
        };
        Some(SignalSample {
            rsrp_dbm,
            rsrq: Some(rsrq),
            sinr: Some(snr),
            rssi: None,
        })
    }

    #[must_use]
    pub fn parse_cereg_urc(line: &str) -> Option<RegistrationStatus> {
        let rest = line.strip_prefix("+CEREG:")?.trim();
        let stat_str = rest.split(',').next()?.trim();
        let stat: u32 = stat_str.parse().ok()?;
        Some(RegistrationStatus { stat })
    }

    pub async fn send_payload(&mut self, engine: &Engine, text: &str) -> Result<(), ProfileError> {
        let endpoint = &self.harvest_endpoint;
        let port = self.harvest_port;
        let cmd = format!(r#"AT#XSENDTO="{endpoint}",{port},"{text}""#);
        let (ok, lines) = engine.send_command(&cmd, DEFAULT_FINAL, SEND_DEADLINE).await?;
        if !ok {
            return Err(ProfileError::stage("send_payload", "send rejected"));
        }
        if let Some(line) = lines.iter().find(|l| l.contains("#XSENDTO:")) {
            debug!("send confirmed: {line}");
        }
        Ok(())
    }

    #[must_use]
    pub fn location(&self) -> Option<Fix> {
        None
    }
}

impl Default for LteMProfile {
    fn default() -> Self {
        Self::new()
    }
}

async fn receive_udp(
    engine: &Engine,
    buffer_size: usize,
    ip_filter: Ipv4Addr,
) -> Option<(Ipv4Addr, u16, String)> {
    let cmd = format!("AT#XRECVFROM={buffer_size}");
    let (ok, lines) = engine.send_command(&cmd, DEFAULT_FINAL, SHORT).await.ok()?;
    if !ok {
        return None;
    }

    for (i, line) in lines.iter().enumerate() {
        if let Some((ip, port)) = parse_xrecvfrom(line) {
            let payload = lines.get(i + 1).filter(|l| l.as_str() != "OK" && l.as_str() != "ERROR");
            let payload = payload?.clone();
            if ip != ip_filter {
                warn!("dropping message from unfiltered source {ip}");
                return None;
            }
            return Some((ip, port, payload));
        }
    }
    None
}

fn parse_xrecvfrom(line: &str) -> Option<(Ipv4Addr, u16)> {
    let rest = line.strip_prefix("#XRECVFROM:")?.trim();
    let mut parts = rest.splitn(2, ',');
    let _size: usize = parts.next()?.trim().parse().ok()?;
    let rest = parts.next()?;
    let quote_start = rest.find('"')? + 1;
    let quote_end = rest[quote_start..].find('"')? + quote_start;
    let ip: Ipv4Addr = rest[quote_start..quote_end].parse().ok()?;
    let port_str = rest[quote_end + 1..].trim_start_matches(',').trim();
    let port: u16 = port_str.parse().ok()?;
    Some((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cesq_known_good() {
        let sample = LteMProfile::parse_signal_urc("%CESQ: 50,10,10,20").unwrap();
        assert_eq!(sample.rsrp_dbm, Some(-91));
        assert_eq!(sample.rsrq, Some(10));
    }

    #[test]
    fn test_parse_cesq_255_is_unknown() {
        let sample = LteMProfile::parse_signal_urc("%CESQ: 255,10,10,20").unwrap();
        assert_eq!(sample.rsrp_dbm, None);
    }

    #[test]
    fn test_parse_cereg() {
        assert!(LteMProfile::parse_cereg_urc("+CEREG: 1").unwrap().is_registered());
        assert!(LteMProfile::parse_cereg_urc("+CEREG: 5").unwrap().is_registered());
        assert!(!LteMProfile::parse_cereg_urc("+CEREG: 2").unwrap().is_registered());
    }

    #[test]
    fn test_parse_xrecvfrom() {
        let (ip, port) = parse_xrecvfrom(r#"#XRECVFROM: 5,"100.127.10.16",55555"#).unwrap();
        assert_eq!(ip, Ipv4Addr::new(100, 127, 10, 16));
        assert_eq!(port, 55555);
    }
}
