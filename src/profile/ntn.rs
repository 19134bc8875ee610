//! Profile B — NTN + embedded GNSS (Murata Type 1SC-NTN-style AT shell
//! firmware). Bring-up is long and irreversibly ordered: RAT switch, SIM
//! APDU, GNSS fix wait, SIB31 wait. Send/receive framing is uppercase hex.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, DEFAULT_FINAL};
use crate::error::ProfileError;
use crate::framing;
use crate::message::LocationMessage;

use super::{DeviceIdentity, Fix, NetworkParams, ReceiveSink, RegistrationStatus, SignalSample, SHORT};

const BOOT_DEADLINE: Duration = Duration::from_secs(30);
const GNSS_FIX_DEADLINE: Duration = Duration::from_secs(300);
const SIB31_DEADLINE: Duration = Duration::from_secs(120);
const REGISTRATION_DEADLINE: Duration = Duration::from_secs(120);
const PING_DEADLINE: Duration = Duration::from_secs(60);
const SOCKET_DEADLINE: Duration = Duration::from_secs(15);
const SEND_DEADLINE: Duration = Duration::from_secs(30);
const SOCKETCMD_DEADLINE: Duration = Duration::from_secs(15);

/// Fixed APDU that switches the SIM profile to NTN (bring-up step 5).
const NTN_SIM_APDU: &str =
    r#"AT+CSIM=52,"80C2000015D613190103820282811B0100130799F08900010001""#;

pub struct NtnProfile {
    location: Option<Fix>,
    location_sent: bool,
    recv_socket_id: Option<u32>,
}

impl NtnProfile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            location: None,
            location_sent: false,
            recv_socket_id: None,
        }
    }

    #[must_use]
    pub fn identify(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: "Murata Type 1SC-NTN",
            manufacturer: "Murata",
            family_tag: "murata_type1sc_ntng",
        }
    }

    async fn boot(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        let (ok, _, _) = engine
            .send_command_then_wait_urc("ATZ", DEFAULT_FINAL, "%BOOTEV:0", SHORT, BOOT_DEADLINE)
            .await?;
        if !ok {
            return Err(ProfileError::stage("boot", "no %BOOTEV:0 after ATZ"));
        }
        Ok(())
    }

    pub async fn connect(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        self.boot(engine).await
    }

    pub async fn init_network(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        let (ok, _) = engine.send_command("AT+CPIN?", DEFAULT_FINAL, SHORT).await?;
        if !ok {
            return Err(ProfileError::stage("init_network", "SIM not ready"));
        }

        for cmd in [
            r#"AT%SETACFG="manager.urcBootEv.enabled","true""#,
            r#"AT%SETCFG="SIM_INIT_SELECT_POLICY","0""#,
        ] {
            let _ = engine.send_command(cmd, DEFAULT_FINAL, SHORT).await?;
        }

        self.boot(engine).await?;

        for cmd in [
            r#"AT%SETACFG="radiom.config.multi_rat_enable","true""#,
            r#"AT%SETACFG="radiom.config.preferred_rat_list","none""#,
            r#"AT%SETACFG="radiom.config.auto_preference_mode","none""#,
            r#"AT%SETACFG="locsrv.operation.locsrv_enable","true""#,
            r#"AT%SETACFG="locsrv.internal_gnss.auto_restart","enable""#,
            r#"AT%SETACFG="modem_apps.Mode.AutoConnectMode","true""#,
        ] {
            let _ = engine.send_command(cmd, DEFAULT_FINAL, SHORT).await?;
        }

        self.boot(engine).await?;

        let _ = engine.send_command(NTN_SIM_APDU, DEFAULT_FINAL, SHORT).await?;
        let _ = engine.send_command("AT%RATIMGSEL=2", DEFAULT_FINAL, SHORT).await?;
        let _ = engine
            .send_command(r#"AT%RATACT="NBNTN","1""#, DEFAULT_FINAL, SHORT)
            .await?;
        let band_cmd = format!(r#"AT%SETCFG="BAND","{}""#, net.ntn_band);
        let _ = engine.send_command(&band_cmd, DEFAULT_FINAL, SHORT).await?;

        let _ = engine.send_command("AT+CFUN=0", DEFAULT_FINAL, SHORT).await?;
        let _ = engine
            .send_command(r#"AT%IGNSSEV="FIX",1"#, DEFAULT_FINAL, SHORT)
            .await?;
        let _ = engine
            .send_command(r#"AT%NOTIFYEV="SIB31",1"#, DEFAULT_FINAL, SHORT)
            .await?;
        let _ = engine.send_command("AT%IGNSSACT=0", DEFAULT_FINAL, SHORT).await?;
        let _ = engine.send_command("AT%IGNSSACT=1", DEFAULT_FINAL, SHORT).await?;

        info!("waiting for GNSS fix (up to {}s)", GNSS_FIX_DEADLINE.as_secs());
        let (fix_ok, fix_urc) = engine.wait_for_urc(r#"%IGNSSEVU:"FIX""#, GNSS_FIX_DEADLINE).await;
        if fix_ok {
            if let Some(fix) = parse_gnss_fix(&fix_urc.unwrap_or_default()) {
                info!("GNSS fix acquired: {fix:?}");
                self.location = Some(fix);
            }
        } else {
            // Non-fatal: bring-up continues without a stored location.
            warn!("GNSS fix timeout — continuing without location");
        }

        let _ = engine.send_command("AT+CEREG=2", DEFAULT_FINAL, SHORT).await?;
        let _ = engine.send_command("AT+CFUN=1", DEFAULT_FINAL, SHORT).await?;

        info!("waiting for satellite detection (SIB31)");
        let _ = engine.wait_for_urc(r#"%NOTIFYEV: "SIB31""#, SIB31_DEADLINE).await;

        info!("waiting for network registration");
        let (reg_ok, line) = engine.wait_for_urc("+CEREG:", REGISTRATION_DEADLINE).await;
        if !reg_ok {
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
        _net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        let _ = engine
            .send_command(r#"AT+CGDCONT=1,"IP","soracom.io""#, DEFAULT_FINAL, SHORT)
            .await?;

        let (ok, _, urc) = engine
            .send_command_then_wait_urc(
                r#"AT%PINGCMD=0,"100.127.100.127",1,50,30"#,
                DEFAULT_FINAL,
                "%PINGCMD:",
                SHORT,
                PING_DEADLINE,
            )
            .await?;
        if !ok {
            return Err(ProfileError::stage("configure_pdp", "ping failed"));
        }
        info!("ping successful: {:?}", urc);
        Ok(())
    }

    pub async fn open_udp(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
    ) -> Result<(), ProfileError> {
        let _ = engine.send_command("AT%SOCKETEV=0,1", DEFAULT_FINAL, SHORT).await?;

        let cmd = format!(
            r#"AT%SOCKETCMD="ALLOCATE",1,"UDP","OPEN","{}",{}"#,
            net.harvest_endpoint, net.harvest_port
        );
        let (ok, _) = engine.send_command(&cmd, DEFAULT_FINAL, SOCKET_DEADLINE).await?;
        if !ok {
            return Err(ProfileError::stage("open_udp", "allocate rejected"));
        }

        let (ok, _) = engine
            .send_command(r#"AT%SOCKETCMD="ACTIVATE",1"#, DEFAULT_FINAL, SOCKET_DEADLINE)
            .await?;
        if !ok {
            return Err(ProfileError::stage("open_udp", "activate rejected"));
        }
        Ok(())
    }

    /// Not applicable for Profile B — uses a LISTEN socket instead.
    pub async fn bind_udp(&mut self, _engine: &Engine, _port: u16) -> Result<(), ProfileError> {
        Ok(())
    }

    pub async fn setup_receive(
        &mut self,
        engine: &Engine,
        net: &NetworkParams,
        sink: ReceiveSink,
    ) -> Result<(), ProfileError> {
        let cmd = format!(r#"AT%SOCKETCMD="ALLOCATE",1,"UDP","LISTEN","0.0.0.0",,{}"#, net.udp_port);
        let (ok, _) = engine.send_command(&cmd, DEFAULT_FINAL, SOCKET_DEADLINE).await?;
        if !ok {
            return Err(ProfileError::stage("setup_receive", "allocate rejected"));
        }

        let (ok, urc) = engine.wait_for_urc("%SOCKETCMD:", SOCKETCMD_DEADLINE).await;
        if ok {
            if let Some(id) = urc.as_deref().and_then(parse_socketcmd_id) {
                self.recv_socket_id = Some(id);
            }
        }
        // If %SOCKETCMD: never arrives, fall back to id 1 — the modem almost
        // always allocates the first LISTEN socket as 1.
        let socket_id = self.recv_socket_id.unwrap_or(1);

        let activate_cmd = format!(r#"AT%SOCKETCMD="ACTIVATE",{socket_id}"#);
        let (ok, _) = engine
            .send_command(&activate_cmd, DEFAULT_FINAL, SOCKET_DEADLINE)
            .await?;
        if !ok {
            return Err(ProfileError::stage("setup_receive", "activate rejected"));
        }

        let buffer_size = net.udp_buffer_size;
        let engine = engine.clone();
        engine.clone().urc().subscribe("%SOCKETEV:", move |_line| {
            let engine = engine.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Some((ip, port, payload)) =
                    receive_socketdata(&engine, socket_id, buffer_size).await
                {
                    sink(ip, port, payload);
                }
            });
        });
        Ok(())
    }

    pub async fn subscribe_signal(&mut self, engine: &Engine) -> Result<(), ProfileError> {
        let (ok, _) = engine.send_command(r#"AT%MEAS="8""#, DEFAULT_FINAL, SHORT).await?;
        if !ok {
            return Err(ProfileError::stage("subscribe_signal", "rejected"));
        }
        Ok(())
    }

    #[must_use]
    pub fn parse_signal_urc(line: &str) -> Option<SignalSample> {
        parse_meas(line)
    }

    #[must_use]
    pub fn parse_cereg_urc(line: &str) -> Option<RegistrationStatus> {
        let rest = line.trim_start_matches('+').strip_prefix("CEREG:")?.trim();
        let stat_str = rest.split(',').next()?.trim();
        let stat: u32 = stat_str.parse().ok()?;
        Some(RegistrationStatus { stat })
    }

    pub async fn send_payload(&mut self, engine: &Engine, text: &str) -> Result<(), ProfileError> {
        // Send-before-first-message location rule: sticky for the session.
        if !self.location_sent {
            if let Some(fix) = self.location.clone() {
                let loc_msg = LocationMessage::new(fix.lat, fix.lon);
                self.send_hex_data(engine, &loc_msg.encode()).await?;
                self.location_sent = true;
            }
        }
        self.send_hex_data(engine, text).await
    }

    async fn send_hex_data(&mut self, engine: &Engine, data: &str) -> Result<(), ProfileError> {
        let (size, hex) = framing::encode(data.as_bytes());
        let cmd = format!(r#"AT%SOCKETDATA="SEND",1,{size},"{hex}""#);
        let (ok, _, _) = engine
            .send_command_then_wait_urc(&cmd, DEFAULT_FINAL, "%SOCKETEV:1,1", SHORT, SEND_DEADLINE)
            .await?;
        if !ok {
            return Err(ProfileError::stage("send_payload", "send not acknowledged"));
        }
        Ok(())
    }

    #[must_use]
    pub fn location(&self) -> Option<Fix> {
        self.location.clone()
    }
}

impl Default for NtnProfile {
    fn default() -> Self {
        Self::new()
    }
}

async fn receive_socketdata(
    engine: &Engine,
    socket_id: u32,
    buffer_size: usize,
) -> Option<(Ipv4Addr, u16, String)> {
    let cmd = format!(r#"AT%SOCKETDATA="RECEIVE",{socket_id},{buffer_size}"#);
    let (ok, lines) = engine.send_command(&cmd, DEFAULT_FINAL, SHORT).await.ok()?;
    if !ok {
        return None;
    }
    lines.iter().find_map(|l| parse_socketdata(l))
}

/// `%SOCKETDATA:<id>,<size>,<read_len>,"<HEX>",<src_ip>,<src_port>`; quoting
/// of `<src_ip>` may be present or absent.
fn parse_socketdata(line: &str) -> Option<(Ipv4Addr, u16, String)> {
    let rest = line.strip_prefix("%SOCKETDATA:")?;
    let mut parts = rest.splitn(4, ',');
    let _id: u32 = parts.next()?.trim().parse().ok()?;
    let _size: usize = parts.next()?.trim().parse().ok()?;
    let _read_len: usize = parts.next()?.trim().parse().ok()?;
    let rest = parts.next()?;

    let quote_start = rest.find('"')? + 1;
    let quote_end = rest[quote_start..].find('"')? + quote_start;
    let hex_payload = &rest[quote_start..quote_end];
    let after_hex = rest[quote_end + 1..].trim_start_matches(',');

    let mut tail = after_hex.splitn(2, ',');
    let ip_field = tail.next()?.trim().trim_matches('"');
    let port_field = tail.next().unwrap_or("0").trim();

    let ip: Ipv4Addr = ip_field.parse().ok()?;
    let port: u16 = port_field.parse().unwrap_or(0);

    let bytes = framing::decode(hex_payload).ok()?;
    let payload = String::from_utf8(bytes).ok()?;
    Some((ip, port, payload))
}

fn parse_socketcmd_id(line: &str) -> Option<u32> {
    line.strip_prefix("%SOCKETCMD:")?.trim().parse().ok()
}

/// `%IGNSSEVU:"FIX",<n>,"<time>","<date>","<alt>","<lat>","<lon>",…`
fn parse_gnss_fix(line: &str) -> Option<Fix> {
    let rest = line.strip_prefix(r#"%IGNSSEVU:"FIX","#)?;
    // Skip the fix-quality integer field.
    let comma = rest.find(',')?;
    let rest = &rest[comma + 1..];
    let fields = split_quoted_csv(rest);
    // time, date, alt, lat, lon
    let lat = fields.get(3)?.clone();
    let lon = fields.get(4)?.clone();
    Some(Fix { lat, lon })
}

/// Split a `"a","b","c"` style tail into unquoted fields.
fn split_quoted_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|f| f.trim().trim_matches('"').to_string())
        .collect()
}

/// `%MEAS:Signal Quality:RSRP=<n>,RSRQ=<n>,SINR=<n>,RSSI=<n>` — signed
/// integers, tolerant whitespace.
fn parse_meas(line: &str) -> Option<SignalSample> {
    if !line.starts_with("%MEAS:") {
        return None;
    }
    let rsrp = extract_signed_field(line, "RSRP=")?;
    let rsrq = extract_signed_field(line, "RSRQ=")?;
    let sinr = extract_signed_field(line, "SINR=")?;
    let rssi = extract_signed_field(line, "RSSI=")?;
    Some(SignalSample {
        rsrp_dbm: Some(rsrp),
        rsrq: Some(rsrq),
        sinr: Some(sinr),
        rssi: Some(rssi),
    })
}

fn extract_signed_field(line: &str, key: &str) -> Option<i32> {
    let idx = line.find(key)? + key.len();
    let rest = line[idx..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '-'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cereg() {
        assert!(NtnProfile::parse_cereg_urc("+CEREG: 1").unwrap().is_registered());
        assert!(!NtnProfile::parse_cereg_urc("+CEREG: 0").unwrap().is_registered());
    }

    #[test]
    fn test_parse_meas() {
        let sample = parse_meas("%MEAS:Signal Quality:RSRP=-91,RSRQ=-10,SINR=5,RSSI=-60").unwrap();
        assert_eq!(sample.rsrp_dbm, Some(-91));
        assert_eq!(sample.rsrq, Some(-10));
        assert_eq!(sample.sinr, Some(5));
        assert_eq!(sample.rssi, Some(-60));
    }

    #[test]
    fn test_parse_gnss_fix() {
        let line = r#"%IGNSSEVU:"FIX",1,"12:00:00","2026-01-01","10.0","35.681236","139.767125""#;
        let fix = parse_gnss_fix(line).unwrap();
        assert_eq!(fix.lat, "35.681236");
        assert_eq!(fix.lon, "139.767125");
    }

    #[test]
    fn test_parse_socketdata_quoted_ip() {
        let line = r#"%SOCKETDATA:1,5,5,"68656C6C6F","100.127.10.16",55555"#;
        let (ip, port, payload) = parse_socketdata(line).unwrap();
        assert_eq!(ip, Ipv4Addr::new(100, 127, 10, 16));
        assert_eq!(port, 55555);
        assert_eq!(payload, "hello");
    }

    #[test]
    fn test_parse_socketcmd_id() {
        assert_eq!(parse_socketcmd_id("%SOCKETCMD:3"), Some(3));
    }
}
