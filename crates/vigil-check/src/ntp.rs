//! NTP probe: one NTPv3 client exchange over UDP.

use crate::base::Probe;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use vigil_common::{Status, StatusDescription};

const NTP_PACKET_SIZE: usize = 48;
const SOCKET_DEADLINE: Duration = Duration::from_secs(10);
/// NTP counts seconds from 1900-01-01, Unix from 1970-01-01.
const NTP_UNIX_EPOCH_DELTA: u32 = 2_208_988_800;
/// Offset of the receive timestamp inside the packet.
const RECEIVE_TS_OFFSET: usize = 32;

/// leap indicator (2 bits), version (3 bits), mode (3 bits).
fn encode_leap_version_mode(leap: u8, version: u8, mode: u8) -> u8 {
    leap * 64 + version * 8 + mode
}

#[cfg(test)]
fn decode_leap_version_mode(value: u8) -> (u8, u8, u8) {
    (value / 64, (value / 8) & 0x7, value & 0x7)
}

/// An NTPv3 client request: leap 0, version 3, mode 3, everything else
/// zero.
fn client_packet() -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = encode_leap_version_mode(0, 3, 3);
    packet
}

fn ntp_timestamp_to_time(seconds: u32, fraction: u32) -> DateTime<Utc> {
    let unix_seconds = i64::from(seconds.wrapping_sub(NTP_UNIX_EPOCH_DELTA));
    let nanos = (f64::from(fraction) / f64::from(u32::MAX) * 1e9) as u32;
    Utc.timestamp_opt(unix_seconds, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Verdict over a reply already read from the socket.
fn evaluate_reply(reply: &[u8], now: DateTime<Utc>, rtt: Duration) -> StatusDescription {
    if reply.len() != NTP_PACKET_SIZE {
        return StatusDescription::new(Status::Critical, "No data received from server");
    }
    let stratum = reply[1];
    if stratum == 0 || stratum == 16 {
        return StatusDescription::new(Status::Critical, "NTP server not (yet) synchronized");
    }
    let seconds = u32::from_be_bytes([
        reply[RECEIVE_TS_OFFSET],
        reply[RECEIVE_TS_OFFSET + 1],
        reply[RECEIVE_TS_OFFSET + 2],
        reply[RECEIVE_TS_OFFSET + 3],
    ]);
    let fraction = u32::from_be_bytes([
        reply[RECEIVE_TS_OFFSET + 4],
        reply[RECEIVE_TS_OFFSET + 5],
        reply[RECEIVE_TS_OFFSET + 6],
        reply[RECEIVE_TS_OFFSET + 7],
    ]);
    let receive_time = ntp_timestamp_to_time(seconds, fraction);
    if (now - receive_time).num_seconds().abs() > 10 {
        return StatusDescription::new(Status::Critical, "Local time and NTP time does not match");
    }
    StatusDescription::new(
        Status::Ok,
        format!("NTP OK - {} ms response time", rtt.as_millis()),
    )
}

/// NTP check against `address` (`host:port` form).
pub struct NtpProbe {
    address: String,
}

impl NtpProbe {
    pub fn new(address: impl Into<String>) -> NtpProbe {
        NtpProbe {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Probe for NtpProbe {
    async fn check(&self) -> StatusDescription {
        if self.address.is_empty() {
            return StatusDescription::new(Status::Ok, "");
        }
        let started = Instant::now();

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::debug!(error = %err, "unable to create UDP socket");
                return StatusDescription::new(
                    Status::Unknown,
                    "Checker error. Unable to create UDP socket",
                );
            }
        };

        if let Err(err) = socket.send_to(&client_packet(), &self.address).await {
            tracing::debug!(address = %self.address, error = %err, "NTP send failed");
            return StatusDescription::new(
                Status::Critical,
                format!("Unable to reach {:?}", self.address),
            );
        }

        let mut reply = [0u8; NTP_PACKET_SIZE];
        let received = match timeout(SOCKET_DEADLINE, socket.recv(&mut reply)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => {
                return StatusDescription::new(Status::Critical, "No data received from server")
            }
            Err(_) => {
                return StatusDescription::new(
                    Status::Critical,
                    "Connection timed out after 10 seconds",
                )
            }
        };

        evaluate_reply(&reply[..received], Utc::now(), started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_with(stratum: u8, receive_time: DateTime<Utc>) -> [u8; NTP_PACKET_SIZE] {
        let mut reply = [0u8; NTP_PACKET_SIZE];
        reply[0] = encode_leap_version_mode(0, 3, 4);
        reply[1] = stratum;
        let ntp_seconds = (receive_time.timestamp() as u32).wrapping_add(NTP_UNIX_EPOCH_DELTA);
        reply[RECEIVE_TS_OFFSET..RECEIVE_TS_OFFSET + 4]
            .copy_from_slice(&ntp_seconds.to_be_bytes());
        reply
    }

    #[test]
    fn leap_version_mode_roundtrip() {
        let encoded = encode_leap_version_mode(0, 3, 3);
        assert_eq!(encoded, 0x1b);
        assert_eq!(decode_leap_version_mode(encoded), (0, 3, 3));
    }

    #[test]
    fn unsynchronized_stratum_is_critical() {
        let now = Utc::now();
        for stratum in [0u8, 16] {
            let verdict = evaluate_reply(&reply_with(stratum, now), now, Duration::from_millis(5));
            assert_eq!(verdict.current_status, Status::Critical);
            assert_eq!(verdict.description, "NTP server not (yet) synchronized");
        }
    }

    #[test]
    fn clock_drift_is_critical() {
        let now = Utc::now();
        let reply = reply_with(2, now - chrono::Duration::seconds(42));
        let verdict = evaluate_reply(&reply, now, Duration::from_millis(5));
        assert_eq!(verdict.current_status, Status::Critical);
        assert_eq!(verdict.description, "Local time and NTP time does not match");
    }

    #[test]
    fn synchronized_server_is_ok() {
        let now = Utc::now();
        let verdict = evaluate_reply(&reply_with(2, now), now, Duration::from_millis(5));
        assert_eq!(verdict.current_status, Status::Ok);
        assert!(verdict.description.starts_with("NTP OK"));
    }

    #[test]
    fn short_reply_is_critical() {
        let verdict = evaluate_reply(&[0u8; 12], Utc::now(), Duration::from_millis(5));
        assert_eq!(verdict.current_status, Status::Critical);
        assert_eq!(verdict.description, "No data received from server");
    }
}
