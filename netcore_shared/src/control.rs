//! Control protocol and connection lifecycle.
//!
//! The per-peer control channel is a line-terminated ASCII command dialog
//! carried over the reliable stream, used before `JOIN` and for the
//! telnet-style `INFO`/`TIME` queries external tooling can issue against a
//! running server. Everything here is plain text by design: unlike the
//! post-JOIN reliable framing (see [`crate::receiver`]), the original engine
//! never put this dialog behind a binary codec, since it had to remain
//! probeable with a raw socket client.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{NetError, NetResult};
use crate::transport::ReliableStream;

/// Longest command line the server will read before terminating the node;
/// matches the original's `MAX_COMMAND_LEN` guard against a client that
/// never sends a newline.
pub const MAX_COMMAND_LEN: usize = 80;

/// Information advertised in reply to `INFO` and collected by
/// `look_for_hosts`. The wire format is `key=value` lines between `BEGIN`
/// and `END`, not JSON, so discovery works against a bare `telnet`/`nc`
/// session the same way the original protocol did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub game: String,
    pub player_count: usize,
    pub max_players: usize,
    pub can_join: bool,
}

impl ServerInfo {
    /// Renders the `BEGIN\n...\nEND\n` reply body (without the
    /// `BEGIN`/`END` markers themselves, which the caller frames).
    pub fn to_lines(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "name={}", self.name);
        let _ = writeln!(out, "game={}", self.game);
        let _ = writeln!(out, "players={}", self.player_count);
        let _ = writeln!(out, "max_players={}", self.max_players);
        let _ = writeln!(out, "can_join={}", self.can_join);
        out
    }

    /// Parses the lines between `BEGIN` and `END` back into a `ServerInfo`.
    /// Unknown keys are ignored; missing keys fall back to defaults, the
    /// same tolerant policy `Sv_StringToInfo` applies line-by-line.
    pub fn from_lines(body: &str) -> Self {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in body.lines() {
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key.trim(), value.trim());
            }
        }
        ServerInfo {
            name: fields.get("name").unwrap_or(&"").to_string(),
            game: fields.get("game").unwrap_or(&"").to_string(),
            player_count: fields.get("players").and_then(|v| v.parse().ok()).unwrap_or(0),
            max_players: fields.get("max_players").and_then(|v| v.parse().ok()).unwrap_or(0),
            can_join: fields.get("can_join").map(|v| *v == "true").unwrap_or(false),
        }
    }
}

/// One parsed control-channel command, pre-JOIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Info,
    Join { udp_port: u16, name: String },
    Time,
    Bye,
}

/// Parses a single command line (without its trailing `\n`). Any input that
/// is not one of the four known commands is reported as a protocol error,
/// which callers turn into a `Huh?\n` reply followed by terminating the
/// node, exactly as `N_ExecuteCommand` does.
pub fn parse_command(line: &str) -> NetResult<ControlCommand> {
    if line.len() >= MAX_COMMAND_LEN || line.contains('\0') {
        return Err(NetError::Protocol("command too long or contains NUL".to_string()));
    }
    if line == "INFO" {
        return Ok(ControlCommand::Info);
    }
    if line == "TIME" {
        return Ok(ControlCommand::Time);
    }
    if line == "BYE" {
        return Ok(ControlCommand::Bye);
    }
    if let Some(rest) = line.strip_prefix("JOIN ") {
        let (port_hex, name) = rest
            .split_once(' ')
            .ok_or_else(|| NetError::Protocol("JOIN missing name".to_string()))?;
        if port_hex.len() != 4 {
            return Err(NetError::Protocol("JOIN port must be 4 hex digits".to_string()));
        }
        let udp_port = u16::from_str_radix(port_hex, 16)
            .map_err(|_| NetError::Protocol("JOIN port is not valid hex".to_string()))?;
        if udp_port == 0 {
            return Err(NetError::Protocol("JOIN port must be nonzero".to_string()));
        }
        if name.is_empty() {
            return Err(NetError::Protocol("JOIN name is empty".to_string()));
        }
        return Ok(ControlCommand::Join {
            udp_port,
            name: name.to_string(),
        });
    }
    Err(NetError::Protocol(format!("unrecognized command: {line:?}")))
}

/// Formats the `JOIN <hhhh> <name>\n` line a client sends to request entry.
pub fn format_join(udp_port: u16, name: &str) -> String {
    format!("JOIN {udp_port:04x} {name}\n")
}

/// Formats the server's `ENTER <hhhh>\n` acceptance reply.
pub fn format_enter(udp_port: u16) -> String {
    format!("ENTER {udp_port:04x}\n")
}

/// Parses an `ENTER <hhhh>\n` reply (without the trailing `\n`), returning
/// the advertised UDP port.
pub fn parse_enter(line: &str) -> NetResult<u16> {
    let hex = line
        .strip_prefix("ENTER ")
        .ok_or_else(|| NetError::Protocol(format!("unexpected JOIN reply: {line:?}")))?;
    u16::from_str_radix(hex.trim(), 16)
        .map_err(|_| NetError::Protocol("ENTER port is not valid hex".to_string()))
}

/// Reads one LF-terminated line (without the LF) from `stream`, byte by
/// byte, stopping at [`MAX_COMMAND_LEN`] to bound a client that never sends
/// a newline — mirrors `N_GetLine`'s fixed-size command buffer.
pub async fn read_line(stream: &mut dyn ReliableStream) -> NetResult<String> {
    let mut line = Vec::with_capacity(32);
    let mut byte = [0u8; 1];
    loop {
        if line.len() >= MAX_COMMAND_LEN {
            return Err(NetError::Protocol("command line too long".to_string()));
        }
        stream
            .recv_exact(&mut byte)
            .await
            .map_err(|_| NetError::PeerClosed)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|_| NetError::Protocol("command is not valid UTF-8".to_string()))
}

pub async fn write_line(stream: &mut dyn ReliableStream, line: &str) -> NetResult<()> {
    stream
        .send_all(line.as_bytes())
        .await
        .map_err(|_| NetError::PeerClosed)
}

/// Reads into `stream` until the buffer contains `END\n`, or the bound is
/// exceeded, or `timeout` elapses — the client side of `look_for_hosts`
/// waiting out the server's `BEGIN\n...\nEND\n` reply.
pub async fn read_until_end_marker(
    stream: &mut dyn ReliableStream,
    timeout: Duration,
) -> NetResult<String> {
    const MAX_REPLY: usize = 8 * 1024;
    let mut buf = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if buf.windows(5).any(|w| w == b"\nEND\n") || buf.starts_with(b"END\n") {
            break;
        }
        if buf.len() >= MAX_REPLY {
            return Err(NetError::Protocol("discovery reply too large".to_string()));
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(NetError::Protocol("discovery reply timed out".to_string()));
        }
        let mut byte = [0u8; 1];
        match tokio::time::timeout(remaining, stream.recv_exact(&mut byte)).await {
            Ok(Ok(())) => buf.push(byte[0]),
            Ok(Err(_)) => {
                debug!("stream closed while waiting for discovery reply");
                break;
            }
            Err(_) => return Err(NetError::Protocol("discovery reply timed out".to_string())),
        }
    }
    String::from_utf8(buf).map_err(|_| NetError::Protocol("discovery reply is not valid UTF-8".to_string()))
}

/// Extracts the `ServerInfo` body between `BEGIN` and `END` markers from a
/// raw discovery reply, tolerating either marker appearing without its
/// normal surrounding newline.
pub fn extract_server_info(reply: &str) -> Option<ServerInfo> {
    let begin = reply.find("BEGIN")?;
    let end = reply.find("END")?;
    if end <= begin {
        return None;
    }
    let body = &reply[begin + "BEGIN".len()..end];
    Some(ServerInfo::from_lines(body))
}

/// Formats the `TIME\n` reply: seconds elapsed since service start, three
/// fractional digits, matching `sprintf(buf, "%.3f\n", Sys_GetSeconds())`.
pub fn format_time_reply(elapsed: Duration) -> String {
    format!("{:.3}\n", elapsed.as_secs_f64())
}

pub fn log_rejected_command(line: &str, reason: &NetError) {
    warn!(command = %line, error = %reason, "rejecting control command");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command("INFO").unwrap(), ControlCommand::Info);
        assert_eq!(parse_command("TIME").unwrap(), ControlCommand::Time);
        assert_eq!(parse_command("BYE").unwrap(), ControlCommand::Bye);
        assert_eq!(
            parse_command("JOIN 1a2b Alice").unwrap(),
            ControlCommand::Join {
                udp_port: 0x1a2b,
                name: "Alice".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_join() {
        assert!(parse_command("JOIN zzzz Alice").is_err());
        assert!(parse_command("JOIN 0000 Alice").is_err());
        assert!(parse_command("JOIN 1a2b").is_err());
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(parse_command("WAT").is_err());
    }

    #[test]
    fn rejects_oversized_command() {
        let long = "A".repeat(MAX_COMMAND_LEN);
        assert!(parse_command(&long).is_err());
    }

    #[test]
    fn enter_round_trips() {
        let line = format_enter(0x1a2b);
        assert_eq!(parse_enter(line.trim_end()).unwrap(), 0x1a2b);
    }

    #[test]
    fn server_info_round_trips_through_lines() {
        let info = ServerInfo {
            name: "Arena".to_string(),
            game: "doom".to_string(),
            player_count: 3,
            max_players: 16,
            can_join: true,
        };
        let rendered = format!("BEGIN\n{}END\n", info.to_lines());
        let parsed = extract_server_info(&rendered).unwrap();
        assert_eq!(parsed, info);
    }
}
