//! The multicast (network-camera) probe. Periodically broadcasts a
//! service-discovery datagram to the well-known WS-Discovery multicast
//! group/port on every non-loopback, non-point-to-point interface with a
//! private IPv4 address, then listens for replies for `probe_window`.
//!
//! XML reply parsing is a small hand-rolled scanner rather than a full XML
//! crate (see `DESIGN.md`'s open-question log): replies are short, and the
//! only field extracted is the `XAddrs` service endpoint.

use super::ObservationSender;
use crate::config::DiscoveryConfig;
use base::strutil::redact_url_credentials;
use db::camera::{Observation, Transport};
use jiff::Timestamp;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 3702;

const PROBE_DATAGRAM: &[u8] = br#"<?xml version="1.0"?><Probe xmlns="urn:schemas-sentryedge:discovery"/>"#;

/// Extracts the contents of the first `<...:{tag}>...</...:{tag}>`-shaped
/// element in `payload`, tolerating any namespace prefix (or none).
pub(crate) fn extract_tag(payload: &str, tag: &str) -> Option<String> {
    let open_tag_start = payload.find(tag)?;
    let after_tag = &payload[open_tag_start..];
    let content_start = after_tag.find('>')? + 1;
    let content = &after_tag[content_start..];
    let content_end = content.find('<')?;
    let text = content[..content_end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Extracts the contents of the first `<...:XAddrs>...</...:XAddrs>`-shaped
/// element in `payload`, tolerating any namespace prefix (or none). `XAddrs`
/// is whitespace-separated if a device advertises multiple endpoints; only
/// the first is used.
pub(crate) fn extract_xaddrs(payload: &str) -> Option<String> {
    extract_tag(payload, "XAddrs").map(|text| text.split_whitespace().next().unwrap_or(&text).to_string())
}

fn is_candidate_ipv4(addr: Ipv4Addr, flags: nix::net::if_::InterfaceFlags) -> bool {
    use nix::net::if_::InterfaceFlags;
    if !flags.contains(InterfaceFlags::IFF_UP) {
        return false;
    }
    if flags.contains(InterfaceFlags::IFF_LOOPBACK) || flags.contains(InterfaceFlags::IFF_POINTOPOINT) {
        return false;
    }
    addr.is_private()
}

/// Returns the local IPv4 addresses eligible to send the probe from.
fn candidate_addresses() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    let iter = match nix::ifaddrs::getifaddrs() {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "enumerating network interfaces");
            return out;
        }
    };
    for ifaddr in iter {
        let Some(address) = ifaddr.address else { continue };
        let Some(sin) = address.as_sockaddr_in() else { continue };
        let addr = Ipv4Addr::from(sin.ip());
        if is_candidate_ipv4(addr, ifaddr.flags) {
            out.push(addr);
        }
    }
    out
}

async fn probe_once(tx: &ObservationSender, cfg: &DiscoveryConfig, http: &reqwest::Client) {
    let addresses = candidate_addresses();
    if addresses.is_empty() {
        debug!("no candidate interfaces for multicast probe this tick");
        return;
    }
    for local_addr in addresses {
        if let Err(e) = probe_from(local_addr, tx, cfg, http).await {
            debug!(%local_addr, error = %e, "multicast probe failed on this interface");
        }
    }
}

async fn probe_from(
    local_addr: Ipv4Addr,
    tx: &ObservationSender,
    cfg: &DiscoveryConfig,
    http: &reqwest::Client,
) -> Result<(), base::Error> {
    use base::ResultExt;
    let socket = tokio::net::UdpSocket::bind((local_addr, 0))
        .await
        .err_kind(base::ErrorKind::Internal)?;
    socket
        .send_to(PROBE_DATAGRAM, (MULTICAST_GROUP, MULTICAST_PORT))
        .await
        .err_kind(base::ErrorKind::Internal)?;

    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cfg.probe_window_secs);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let recv = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
        let Ok(Ok((n, from))) = recv else { break };
        let payload = String::from_utf8_lossy(&buf[..n]);
        let Some(xaddr) = extract_xaddrs(&payload) else {
            debug!(%from, "malformed discovery reply, ignoring");
            continue;
        };
        if let Some(obs) = fetch_camera(&xaddr, http).await {
            let _ = tx.send(obs).await;
        }
    }
    Ok(())
}

/// Issues the device-information and media-profiles requests against a
/// discovered service endpoint (spec §4.1: two subsequent HTTP requests per
/// endpoint). Tolerates partial/malformed responses by returning `None`
/// rather than propagating an error — a single bad camera must never abort
/// the probe tick.
async fn fetch_camera(xaddr: &str, http: &reqwest::Client) -> Option<Observation> {
    let base = xaddr.trim_end_matches('/');
    let host = url::Url::parse(xaddr).ok()?.host_str()?.to_string();

    let device_info_url = format!("{base}/device_information");
    let device_info = http.get(&device_info_url).send().await.ok()?;
    if !device_info.status().is_success() {
        debug!(url = %redact_url_credentials(&device_info_url), status = %device_info.status(), "device-info request failed");
        return None;
    }
    let device_body = device_info.text().await.ok()?;
    let manufacturer = extract_tag(&device_body, "Manufacturer");
    let model = extract_tag(&device_body, "Model");
    if let Some(serial) = extract_tag(&device_body, "SerialNumber") {
        debug!(%serial, host = %host, "discovered device serial");
    }

    let profiles_url = format!("{base}/media/profiles");
    let profiles = http.get(&profiles_url).send().await.ok()?;
    if !profiles.status().is_success() {
        debug!(url = %redact_url_credentials(&profiles_url), status = %profiles.status(), "media-profiles request failed");
        return None;
    }
    let profiles_body = profiles.text().await.ok()?;
    // The stream URI is the real RTSP connection descriptor; xaddr is only
    // the WS-Discovery service endpoint and is never used as `connection`.
    // Per-camera credentials aren't known at discovery time — they're
    // applied to this URI later when the pipeline connects (see
    // `pipeline::connection_url`).
    let stream_uri = extract_tag(&profiles_body, "StreamUri")?;
    let has_ptz = profiles_body.contains("PTZConfiguration");

    Some(Observation {
        id: host,
        transport: Transport::Rtsp,
        connection: stream_uri,
        manufacturer,
        model,
        has_ptz,
        has_snapshot: true,
        has_video: true,
        observed_at: Timestamp::now(),
    })
}

/// Runs the multicast probe loop: every `discovery.interval`, and once
/// immediately on startup, broadcasts and collects replies for
/// `probe_window`. Exits only on shutdown.
pub async fn run(tx: ObservationSender, cfg: DiscoveryConfig, mut shutdown: base::shutdown::Receiver) {
    let http = reqwest::Client::new();
    loop {
        probe_once(&tx, &cfg, &http).await;
        if shutdown
            .race(tokio::time::sleep(Duration::from_secs(cfg.interval_secs)))
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_xaddrs_regardless_of_namespace_prefix() {
        let payload = r#"<d:ProbeMatch><d:XAddrs>http://10.0.0.5/onvif/device_service extra</d:XAddrs></d:ProbeMatch>"#;
        assert_eq!(
            extract_xaddrs(payload).as_deref(),
            Some("http://10.0.0.5/onvif/device_service")
        );
    }

    #[test]
    fn tolerates_missing_xaddrs() {
        assert_eq!(extract_xaddrs("<ProbeMatch></ProbeMatch>"), None);
        assert_eq!(extract_xaddrs("not even xml"), None);
    }

    #[test]
    fn extract_tag_reads_device_info_fields() {
        let body = r#"<tds:GetDeviceInformationResponse><tds:Manufacturer>Acme</tds:Manufacturer><tds:Model>CamX200</tds:Model><tds:SerialNumber>SN123</tds:SerialNumber></tds:GetDeviceInformationResponse>"#;
        assert_eq!(extract_tag(body, "Manufacturer").as_deref(), Some("Acme"));
        assert_eq!(extract_tag(body, "Model").as_deref(), Some("CamX200"));
        assert_eq!(extract_tag(body, "SerialNumber").as_deref(), Some("SN123"));
    }

    #[test]
    fn extract_tag_reads_stream_uri_from_media_profiles() {
        let body = r#"<trt:Profiles><tt:StreamUri>rtsp://10.0.0.5/stream1</tt:StreamUri></trt:Profiles>"#;
        assert_eq!(extract_tag(body, "StreamUri").as_deref(), Some("rtsp://10.0.0.5/stream1"));
    }

    #[test]
    fn private_ipv4_detection() {
        assert!(Ipv4Addr::new(192, 168, 1, 5).is_private());
        assert!(!Ipv4Addr::new(8, 8, 8, 8).is_private());
    }
}
