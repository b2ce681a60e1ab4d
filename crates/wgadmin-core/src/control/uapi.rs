//! Text codec for the cross-platform `WireGuard` control protocol.
//!
//! A request is an operation line (`get=1` or `set=1`) followed by
//! `key=value` lines and a blank line. Keys are lowercase hex. Replies end
//! with `errno=<n>` and a blank line.

use std::fmt::Write as FmtWrite;
use std::net::SocketAddr;
use std::time::{Duration, UNIX_EPOCH};

use ipnet::IpNet;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::engine::{DeviceSnapshot, DeviceUpdate, Engine, EngineError, PeerSnapshot, PeerUpdate, EINVAL};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};

/// Largest request or reply accepted, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// Parsed `key=value` lines.
pub type Pairs = Vec<(String, String)>;

/// Splits message lines into key/value pairs.
///
/// # Errors
///
/// Returns `EINVAL` for a line without `=`.
pub fn parse_pairs<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Pairs, EngineError> {
    lines
        .into_iter()
        .map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| EngineError::invalid(format!("malformed line {line:?}")))
        })
        .collect()
}

/// Renders a `set=1` request.
#[must_use]
pub fn encode_set(update: &DeviceUpdate) -> String {
    let mut out = String::from("set=1\n");
    if let Some(ref key) = update.private_key {
        let _ = writeln!(out, "private_key={}", key.to_hex());
    }
    if let Some(port) = update.listen_port {
        let _ = writeln!(out, "listen_port={port}");
    }
    if let Some(mark) = update.fwmark {
        let _ = writeln!(out, "fwmark={mark}");
    }
    if update.replace_peers {
        out.push_str("replace_peers=true\n");
    }
    for peer in &update.peers {
        let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
        if peer.remove {
            out.push_str("remove=true\n");
            continue;
        }
        if let Some(ref psk) = peer.preshared_key {
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
        }
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "endpoint={endpoint}");
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={keepalive}");
        }
        if peer.replace_allowed_ips {
            out.push_str("replace_allowed_ips=true\n");
        }
        for range in &peer.allowed_ips {
            let _ = writeln!(out, "allowed_ip={range}");
        }
    }
    out.push('\n');
    out
}

/// Decodes the body of a `set=1` request.
///
/// # Errors
///
/// Returns `EINVAL` for unknown keys or malformed values.
pub fn decode_set(pairs: &[(String, String)]) -> Result<DeviceUpdate, EngineError> {
    let mut update = DeviceUpdate::default();
    let mut current: Option<PeerUpdate> = None;

    for (key, value) in pairs {
        match key.as_str() {
            "public_key" => {
                if let Some(done) = current.take() {
                    update.peers.push(done);
                }
                current = Some(PeerUpdate::new(PublicKey::from_hex(value).map_err(invalid(key))?));
            }
            _ => match current {
                Some(ref mut peer) => decode_peer_set_key(peer, key, value)?,
                None => decode_device_set_key(&mut update, key, value)?,
            },
        }
    }
    if let Some(done) = current {
        update.peers.push(done);
    }
    Ok(update)
}

fn decode_device_set_key(update: &mut DeviceUpdate, key: &str, value: &str) -> Result<(), EngineError> {
    match key {
        "private_key" => update.private_key = Some(PrivateKey::from_hex(value).map_err(invalid(key))?),
        "listen_port" => update.listen_port = Some(value.parse().map_err(invalid(key))?),
        "fwmark" => update.fwmark = Some(value.parse().map_err(invalid(key))?),
        "replace_peers" => update.replace_peers = parse_true(key, value)?,
        _ => return Err(EngineError::invalid(format!("unknown device key {key:?}"))),
    }
    Ok(())
}

fn decode_peer_set_key(peer: &mut PeerUpdate, key: &str, value: &str) -> Result<(), EngineError> {
    match key {
        "remove" => peer.remove = parse_true(key, value)?,
        "preshared_key" => peer.preshared_key = Some(PresharedKey::from_hex(value).map_err(invalid(key))?),
        "endpoint" => peer.endpoint = Some(value.parse::<SocketAddr>().map_err(invalid(key))?),
        "persistent_keepalive_interval" => {
            peer.persistent_keepalive = Some(value.parse().map_err(invalid(key))?);
        }
        "replace_allowed_ips" => peer.replace_allowed_ips = parse_true(key, value)?,
        "allowed_ip" => peer.allowed_ips.push(value.parse::<IpNet>().map_err(invalid(key))?),
        "protocol_version" => {
            if value != "1" {
                return Err(EngineError::invalid(format!("unsupported protocol version {value}")));
            }
        }
        _ => return Err(EngineError::invalid(format!("unknown peer key {key:?}"))),
    }
    Ok(())
}

/// Renders the body of a `get=1` reply, without the trailing errno.
#[must_use]
pub fn encode_snapshot(snapshot: &DeviceSnapshot) -> String {
    let mut out = String::new();
    if let Some(ref key) = snapshot.private_key {
        let _ = writeln!(out, "private_key={}", key.to_hex());
    }
    let _ = writeln!(out, "listen_port={}", snapshot.listen_port);
    if snapshot.fwmark != 0 {
        let _ = writeln!(out, "fwmark={}", snapshot.fwmark);
    }
    for peer in &snapshot.peers {
        let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
        if let Some(ref psk) = peer.preshared_key {
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
        }
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "endpoint={endpoint}");
        }
        let _ = writeln!(out, "persistent_keepalive_interval={}", peer.persistent_keepalive);
        let since_epoch = peer
            .last_handshake
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        let _ = writeln!(out, "last_handshake_time_sec={}", since_epoch.as_secs());
        let _ = writeln!(out, "last_handshake_time_nsec={}", since_epoch.subsec_nanos());
        let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes);
        let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes);
        for range in &peer.allowed_ips {
            let _ = writeln!(out, "allowed_ip={range}");
        }
    }
    out.push_str("protocol_version=1\n");
    out
}

/// Decodes the body of a `get=1` reply.
///
/// # Errors
///
/// Returns `EINVAL` for malformed values. Unknown keys are skipped.
pub fn decode_snapshot(pairs: &[(String, String)]) -> Result<DeviceSnapshot, EngineError> {
    let mut snapshot = DeviceSnapshot::default();
    let mut current: Option<PeerSnapshot> = None;
    let mut handshake_secs = 0u64;
    let mut handshake_nanos = 0u32;

    let finish = |peer: PeerSnapshot, secs: u64, nanos: u32| PeerSnapshot {
        last_handshake: (secs != 0 || nanos != 0)
            .then(|| UNIX_EPOCH + Duration::new(secs, nanos)),
        ..peer
    };

    for (key, value) in pairs {
        let Some(ref mut peer) = current else {
            match key.as_str() {
                "private_key" => {
                    snapshot.private_key = Some(PrivateKey::from_hex(value).map_err(invalid(key))?);
                }
                "listen_port" => snapshot.listen_port = value.parse().map_err(invalid(key))?,
                "fwmark" => snapshot.fwmark = value.parse().map_err(invalid(key))?,
                "public_key" => {
                    current = Some(PeerSnapshot::new(PublicKey::from_hex(value).map_err(invalid(key))?));
                }
                _ => {}
            }
            continue;
        };

        match key.as_str() {
            "public_key" => {
                let next = PeerSnapshot::new(PublicKey::from_hex(value).map_err(invalid(key))?);
                let done = std::mem::replace(peer, next);
                snapshot.peers.push(finish(done, handshake_secs, handshake_nanos));
                handshake_secs = 0;
                handshake_nanos = 0;
            }
            "preshared_key" => {
                let psk = PresharedKey::from_hex(value).map_err(invalid(key))?;
                peer.preshared_key = (!psk.is_zero()).then_some(psk);
            }
            "endpoint" => peer.endpoint = Some(value.parse().map_err(invalid(key))?),
            "persistent_keepalive_interval" => {
                peer.persistent_keepalive = value.parse().map_err(invalid(key))?;
            }
            "last_handshake_time_sec" => handshake_secs = value.parse().map_err(invalid(key))?,
            "last_handshake_time_nsec" => handshake_nanos = value.parse().map_err(invalid(key))?,
            "tx_bytes" => peer.tx_bytes = value.parse().map_err(invalid(key))?,
            "rx_bytes" => peer.rx_bytes = value.parse().map_err(invalid(key))?,
            "allowed_ip" => peer.allowed_ips.push(value.parse().map_err(invalid(key))?),
            _ => {}
        }
    }
    if let Some(done) = current {
        snapshot.peers.push(finish(done, handshake_secs, handshake_nanos));
    }
    Ok(snapshot)
}

fn invalid<E: std::fmt::Display>(key: &str) -> impl Fn(E) -> EngineError + '_ {
    move |e| EngineError::invalid(format!("invalid {key}: {e}"))
}

fn parse_true(key: &str, value: &str) -> Result<bool, EngineError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(EngineError::invalid(format!("{key} must be true or false"))),
    }
}

fn errno_reply(errno: i32) -> String {
    format!("errno={errno}\n\n")
}

/// Reads lines up to a blank line or EOF.
///
/// # Errors
///
/// Returns an I/O error if the peer sends more than [`MAX_MESSAGE_BYTES`].
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut total = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        total += n;
        if total > MAX_MESSAGE_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "control message too large"));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            break;
        }
        lines.push(trimmed.to_string());
    }
    Ok(lines)
}

/// Handles one control-protocol exchange on `stream`.
///
/// # Errors
///
/// Returns an I/O error if the stream fails. Engine rejections are sent
/// to the client as a non-zero errno, not returned.
pub async fn serve<S, E>(stream: S, engine: &E) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: Engine + ?Sized,
{
    let mut reader = BufReader::new(stream);
    let request = read_message(&mut reader).await?;
    let Some((op, body)) = request.split_first() else {
        return Ok(());
    };

    let result = match op.as_str() {
        "get=1" => engine
            .snapshot()
            .map(|snapshot| format!("{}errno=0\n\n", encode_snapshot(&snapshot))),
        "set=1" => parse_pairs(body.iter().map(String::as_str))
            .and_then(|pairs| decode_set(&pairs))
            .and_then(|update| engine.apply(&update))
            .map(|()| errno_reply(0)),
        other => Err(EngineError::invalid(format!("unknown operation {other:?}"))),
    };

    let reply = result.unwrap_or_else(|e| {
        warn!(error = %e, "control request rejected");
        errno_reply(if e.errno == 0 { EINVAL } else { e.errno })
    });

    let stream = reader.get_mut();
    stream.write_all(reply.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn key() -> PublicKey {
        PrivateKey::generate().public_key()
    }

    fn lines(text: &str) -> Vec<&str> {
        text.lines().take_while(|l| !l.is_empty()).collect()
    }

    #[test]
    fn set_roundtrip() {
        let mut peer = PeerUpdate::new(key());
        peer.preshared_key = Some(PresharedKey::generate());
        peer.endpoint = Some("[2001:db8::1]:51820".parse().expect("addr"));
        peer.persistent_keepalive = Some(25);
        peer.replace_allowed_ips = true;
        peer.allowed_ips = vec!["10.0.0.0/24".parse().expect("cidr"), "::/0".parse().expect("cidr")];
        let mut removed = PeerUpdate::new(key());
        removed.remove = true;
        let update = DeviceUpdate {
            private_key: Some(PrivateKey::generate()),
            listen_port: Some(51820),
            fwmark: Some(0),
            replace_peers: true,
            peers: vec![peer, removed],
        };

        let text = encode_set(&update);
        let body = lines(&text);
        assert_eq!(body[0], "set=1");
        let pairs = parse_pairs(body[1..].iter().copied()).expect("pairs");
        assert_eq!(decode_set(&pairs), Ok(update));
    }

    #[test]
    fn snapshot_roundtrip_keeps_handshake_precision() {
        let mut peer = PeerSnapshot::new(key());
        peer.last_handshake = Some(UNIX_EPOCH + Duration::new(1_700_000_000, 123));
        peer.rx_bytes = 10;
        peer.tx_bytes = 20;
        peer.allowed_ips = vec!["10.0.0.2/32".parse().expect("cidr")];
        let idle = PeerSnapshot::new(key());
        let snapshot = DeviceSnapshot {
            private_key: Some(PrivateKey::generate()),
            listen_port: 41000,
            fwmark: 9,
            peers: vec![peer, idle],
        };

        let text = encode_snapshot(&snapshot);
        let pairs = parse_pairs(lines(&text)).expect("pairs");
        assert_eq!(decode_snapshot(&pairs), Ok(snapshot));
    }

    #[test]
    fn zero_preshared_key_means_none() {
        let pk = key();
        let pairs = vec![
            ("public_key".to_string(), pk.to_hex()),
            ("preshared_key".to_string(), "0".repeat(64)),
        ];
        let snapshot = decode_snapshot(&pairs).expect("decode");
        assert_eq!(snapshot.peers[0].preshared_key, None);
    }

    #[test]
    fn unknown_set_key_rejected() {
        let pairs = vec![("bogus".to_string(), "1".to_string())];
        assert_eq!(decode_set(&pairs).map_err(|e| e.errno), Err(EINVAL));
    }

    #[test]
    fn malformed_line_rejected() {
        assert!(parse_pairs(["no equals sign"]).is_err());
    }

    #[derive(Default)]
    struct RecordingEngine {
        applied: Mutex<Vec<DeviceUpdate>>,
    }

    impl Engine for RecordingEngine {
        fn apply(&self, update: &DeviceUpdate) -> Result<(), EngineError> {
            if update.listen_port == Some(1) {
                return Err(EngineError::invalid("port 1 is reserved"));
            }
            self.applied.lock().push(update.clone());
            Ok(())
        }

        fn snapshot(&self) -> Result<DeviceSnapshot, EngineError> {
            Ok(DeviceSnapshot {
                listen_port: 51820,
                ..DeviceSnapshot::default()
            })
        }

        fn up(&self) -> Result<(), EngineError> {
            Ok(())
        }

        fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    async fn exchange(engine: &RecordingEngine, request: &str) -> String {
        let (mut client, server) = tokio::io::duplex(4096);
        let (served, reply) = tokio::join!(serve(server, engine), async {
            client.write_all(request.as_bytes()).await.expect("write");
            let mut reader = BufReader::new(&mut client);
            read_message(&mut reader).await.expect("read").join("\n")
        });
        served.expect("serve");
        reply
    }

    #[tokio::test]
    async fn serve_applies_set() {
        let engine = RecordingEngine::default();
        let reply = exchange(&engine, "set=1\nlisten_port=51820\n\n").await;
        assert_eq!(reply, "errno=0");
        assert_eq!(engine.applied.lock()[0].listen_port, Some(51820));
    }

    #[tokio::test]
    async fn serve_reports_engine_rejection() {
        let engine = RecordingEngine::default();
        let reply = exchange(&engine, "set=1\nlisten_port=1\n\n").await;
        assert_eq!(reply, format!("errno={EINVAL}"));
        assert!(engine.applied.lock().is_empty());
    }

    #[tokio::test]
    async fn serve_answers_get() {
        let engine = RecordingEngine::default();
        let reply = exchange(&engine, "get=1\n\n").await;
        assert!(reply.starts_with("listen_port=51820\n"));
        assert!(reply.ends_with("errno=0"));
    }

    #[tokio::test]
    async fn serve_rejects_unknown_operation() {
        let engine = RecordingEngine::default();
        let reply = exchange(&engine, "frobnicate=1\n\n").await;
        assert_eq!(reply, format!("errno={EINVAL}"));
    }
}
