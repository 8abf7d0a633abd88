//! Network implementations of the poll seams
//!
//! [`UdpA2sProbe`] speaks the Steam A2S_INFO query (with challenge
//! handling) over UDP. [`TcpRconConnector`] speaks the BattlEye-style
//! admin channel over TCP: framed packets with a CRC32 of the payload, a
//! login handshake, sequenced commands, and an idle keepalive. The rest
//! of the gateway only ever sees the parsed [`A2sInfo`] and
//! [`RconPlayer`] values.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::config::RconConfig;

use super::a2s::A2sProbe;
use super::rcon::{RconConnection, RconConnector};
use super::{A2sInfo, PollError, RconPlayer};

const A2S_INFO_REQUEST: &[u8] = b"\xff\xff\xff\xffTSource Engine Query\x00";
const A2S_CHALLENGE: u8 = 0x41;
const A2S_INFO_RESPONSE: u8 = 0x49;

const RCON_LOGIN: u8 = 0x00;
const RCON_COMMAND: u8 = 0x01;

// ============================================================================
// A2S probe
// ============================================================================

/// A2S_INFO query client over UDP
pub struct UdpA2sProbe {
    address: String,
    deadline: Duration,
    buffer_size: u16,
}

impl UdpA2sProbe {
    /// Create a probe for one query endpoint
    pub fn new(address: String, deadline: Duration, buffer_size: u16) -> Self {
        Self {
            address,
            deadline,
            buffer_size,
        }
    }

    async fn exchange(&self, socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>, PollError> {
        socket.send(request).await?;

        let mut buf = vec![0u8; usize::from(self.buffer_size).max(1400)];
        let n = tokio::time::timeout(self.deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| PollError::Timeout)??;
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl A2sProbe for UdpA2sProbe {
    async fn probe(&self) -> Result<A2sInfo, PollError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.address).await?;

        let start = Instant::now();
        let mut response = self.exchange(&socket, A2S_INFO_REQUEST).await?;

        // The server may demand a challenge echo first
        if response.len() >= 9 && response[4] == A2S_CHALLENGE {
            let mut request = A2S_INFO_REQUEST.to_vec();
            request.extend_from_slice(&response[5..9]);
            response = self.exchange(&socket, &request).await?;
        }

        let mut info = parse_a2s_info(&response)?;
        info.ping = start.elapsed();
        Ok(info)
    }
}

/// Decode an A2S_INFO response payload
fn parse_a2s_info(data: &[u8]) -> Result<A2sInfo, PollError> {
    let mut r = ByteReader::new(data);

    if r.read_u32_le()? != 0xffff_ffff {
        return Err(PollError::Protocol("missing single-packet header".to_string()));
    }
    if r.read_u8()? != A2S_INFO_RESPONSE {
        return Err(PollError::Protocol("unexpected response type".to_string()));
    }

    let _protocol = r.read_u8()?;
    let name = r.read_cstring()?;
    let map = r.read_cstring()?;
    let _folder = r.read_cstring()?;
    let game = r.read_cstring()?;
    let _app_id = r.read_u16_le()?;
    let players = r.read_u8()?;
    let max_players = r.read_u8()?;
    let _bots = r.read_u8()?;
    let _server_type = r.read_u8()?;
    let environment = char::from(r.read_u8()?);
    let _visibility = r.read_u8()?;
    let _vac = r.read_u8()?;
    let version = r.read_cstring()?;

    let mut port = 0u16;
    let mut queue = 0u32;

    if let Ok(edf) = r.read_u8() {
        if edf & 0x80 != 0 {
            port = r.read_u16_le()?;
        }
        if edf & 0x10 != 0 {
            let _steam_id = r.read_u64_le()?;
        }
        if edf & 0x40 != 0 {
            let _spectator_port = r.read_u16_le()?;
            let _spectator_name = r.read_cstring()?;
        }
        if edf & 0x20 != 0 {
            let keywords = r.read_cstring()?;
            queue = parse_queue_keyword(&keywords);
        }
    }

    Ok(A2sInfo {
        name,
        game,
        map,
        version,
        players,
        max_players,
        queue,
        ping: Duration::ZERO,
        port,
        environment,
    })
}

/// Extract the DayZ queue length from the keyword list (`lqs<N>` tag)
fn parse_queue_keyword(keywords: &str) -> u32 {
    keywords
        .split(',')
        .find_map(|tag| tag.strip_prefix("lqs"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

// ============================================================================
// RCon client
// ============================================================================

/// Dials the admin channel over TCP and performs the login handshake
pub struct TcpRconConnector {
    cfg: RconConfig,
}

impl TcpRconConnector {
    /// Create a connector from the instance's RCon settings
    pub fn new(cfg: RconConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait::async_trait]
impl RconConnector for TcpRconConnector {
    type Conn = TcpRconConnection;

    async fn connect(&self) -> Result<TcpRconConnection, PollError> {
        let stream = tokio::time::timeout(self.cfg.deadline(), TcpStream::connect(&self.cfg.address))
            .await
            .map_err(|_| PollError::Timeout)??;

        let mut conn = TcpRconConnection {
            stream,
            deadline: self.cfg.deadline(),
            keepalive: self.cfg.keepalive(),
            last_active: Instant::now(),
            seq: 0,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match conn.login(&self.cfg.password).await {
                Ok(()) => break,
                Err(e) if attempt < self.cfg.login_attempts.max(1) => {
                    tracing::debug!(error = %e, attempt, "RCon login attempt failed");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(conn)
    }
}

/// A logged-in admin-channel connection
pub struct TcpRconConnection {
    stream: TcpStream,
    deadline: Duration,
    keepalive: Duration,
    last_active: Instant,
    seq: u8,
}

impl TcpRconConnection {
    async fn login(&mut self, password: &str) -> Result<(), PollError> {
        let mut payload = vec![0xff, RCON_LOGIN];
        payload.extend_from_slice(password.as_bytes());
        self.write_packet(&payload).await?;

        let response = self.read_packet().await?;
        match response.as_slice() {
            [0xff, RCON_LOGIN, 0x01, ..] => {
                self.last_active = Instant::now();
                Ok(())
            }
            [0xff, RCON_LOGIN, ..] => Err(PollError::Login("password rejected".to_string())),
            _ => Err(PollError::Protocol("unexpected login response".to_string())),
        }
    }

    /// Run one command and return its response body
    async fn command(&mut self, command: &str) -> Result<Vec<u8>, PollError> {
        // An idle connection gets a keepalive nudge first
        if self.last_active.elapsed() >= self.keepalive {
            self.send_command_raw("").await?;
        }
        self.send_command_raw(command).await
    }

    async fn send_command_raw(&mut self, command: &str) -> Result<Vec<u8>, PollError> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let mut payload = vec![0xff, RCON_COMMAND, seq];
        payload.extend_from_slice(command.as_bytes());
        self.write_packet(&payload).await?;

        let mut body = Vec::new();
        let mut parts_seen = 0u8;

        loop {
            let response = self.read_packet().await?;
            if response.len() < 3 || response[0] != 0xff || response[1] != RCON_COMMAND {
                return Err(PollError::Protocol("unexpected command response".to_string()));
            }
            if response[2] != seq {
                // Stale response from an earlier cycle; skip it
                continue;
            }

            let data = &response[3..];
            // Multi-part responses carry a 0x00 marker, a count, and an index
            if data.len() >= 3 && data[0] == 0x00 {
                let total = data[1];
                body.extend_from_slice(&data[3..]);
                parts_seen += 1;
                if parts_seen >= total {
                    break;
                }
            } else {
                body.extend_from_slice(data);
                break;
            }
        }

        self.last_active = Instant::now();
        Ok(body)
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), PollError> {
        if payload.len() > u16::MAX as usize {
            return Err(PollError::Protocol("payload too large".to_string()));
        }

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(b"BE");
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        frame.extend_from_slice(payload);

        tokio::time::timeout(self.deadline, self.stream.write_all(&frame))
            .await
            .map_err(|_| PollError::Timeout)??;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>, PollError> {
        let mut header = [0u8; 8];
        tokio::time::timeout(self.deadline, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| PollError::Timeout)??;

        if &header[0..2] != b"BE" {
            return Err(PollError::Protocol("bad frame magic".to_string()));
        }
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        tokio::time::timeout(self.deadline, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| PollError::Timeout)??;

        if crc32fast::hash(&payload) != crc {
            return Err(PollError::Protocol("frame checksum mismatch".to_string()));
        }

        Ok(payload)
    }
}

#[async_trait::async_trait]
impl RconConnection for TcpRconConnection {
    async fn players(&mut self) -> Result<Vec<RconPlayer>, PollError> {
        let body = self.command("players").await?;
        let text = String::from_utf8_lossy(&body);
        Ok(parse_players_table(&text))
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Parse the text table the `players` command prints.
///
/// Rows look like `0  10.0.0.1:2304  50  <guid>(OK)  Name` with a
/// ` (Lobby)` suffix on the name while the player is still loading.
/// Unparseable rows are skipped.
fn parse_players_table(text: &str) -> Vec<RconPlayer> {
    let mut players = Vec::new();
    let mut in_table = false;

    for line in text.lines() {
        let line = line.trim();

        if !in_table {
            if line.starts_with("---") {
                in_table = true;
            }
            continue;
        }
        if line.is_empty() || line.starts_with('(') {
            break;
        }

        let mut fields = line.split_whitespace();
        let (Some(_idx), Some(addr), Some(ping), Some(guid)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let name_parts: Vec<&str> = fields.collect();
        if name_parts.is_empty() {
            continue;
        }
        let mut name = name_parts.join(" ");

        let lobby = name.ends_with("(Lobby)");
        if lobby {
            name = name.trim_end_matches("(Lobby)").trim_end().to_string();
        }

        players.push(RconPlayer {
            guid: guid.split('(').next().unwrap_or(guid).to_string(),
            name,
            ip: addr.split(':').next().unwrap_or(addr).to_string(),
            ping: ping.parse().unwrap_or(0),
            lobby,
        });
    }

    players
}

// ============================================================================
// Binary reader
// ============================================================================

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PollError> {
        if self.pos + n > self.data.len() {
            return Err(PollError::Protocol("truncated response".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, PollError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, PollError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32_le(&mut self) -> Result<u32, PollError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64_le(&mut self) -> Result<u64, PollError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_cstring(&mut self) -> Result<String, PollError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PollError::Protocol("unterminated string".to_string()))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }
}
