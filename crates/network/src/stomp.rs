// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2025 Danmu Console Developers. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! STOMP 1.2 frame codec for a WebSocket text transport.
//!
//! Each WebSocket text message carries exactly one STOMP frame, or a bare EOL
//! acting as a heartbeat. The codec covers the client frames this crate sends
//! (CONNECT, SUBSCRIBE, UNSUBSCRIBE, DISCONNECT) and the server frames it
//! routes (CONNECTED, MESSAGE, RECEIPT, ERROR).
//!
//! Header names and values are escaped per the STOMP 1.2 specification,
//! except on CONNECT/CONNECTED frames where the specification forbids it.

use strum::{AsRefStr, Display, EnumString};

use crate::error::StompError;

/// Heartbeat frame sent on the negotiated outgoing interval.
pub const HEARTBEAT_FRAME: &str = "\n";

const NULL: char = '\0';

/// STOMP frame command.
#[derive(Clone, Copy, Debug, Display, Hash, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum StompCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    /// Returns `true` for frames whose headers are transmitted unescaped.
    const fn is_connect_frame(self) -> bool {
        matches!(self, Self::Connect | Self::Connected)
    }
}

/// A single STOMP frame: command, ordered headers, and an optional body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    /// Creates a frame with no headers and an empty body.
    #[must_use]
    pub const fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Builds a CONNECT frame advertising STOMP 1.2 and the given heartbeat
    /// intervals (milliseconds, outgoing then incoming). Extra headers such as
    /// `host` or credentials are appended verbatim.
    #[must_use]
    pub fn connect(
        heartbeat_outgoing_ms: u64,
        heartbeat_incoming_ms: u64,
        extra_headers: &[(String, String)],
    ) -> Self {
        let mut headers = vec![
            ("accept-version".to_string(), "1.2".to_string()),
            (
                "heart-beat".to_string(),
                format!("{heartbeat_outgoing_ms},{heartbeat_incoming_ms}"),
            ),
        ];
        headers.extend_from_slice(extra_headers);
        Self {
            command: StompCommand::Connect,
            headers,
            body: String::new(),
        }
    }

    /// Builds a SUBSCRIBE frame for `destination` with the given numeric id.
    #[must_use]
    pub fn subscribe(id: u64, destination: &str) -> Self {
        Self {
            command: StompCommand::Subscribe,
            headers: vec![
                ("id".to_string(), format!("sub-{id}")),
                ("destination".to_string(), destination.to_string()),
                ("ack".to_string(), "auto".to_string()),
            ],
            body: String::new(),
        }
    }

    /// Builds an UNSUBSCRIBE frame for the subscription with the given id.
    #[must_use]
    pub fn unsubscribe(id: u64) -> Self {
        Self {
            command: StompCommand::Unsubscribe,
            headers: vec![("id".to_string(), format!("sub-{id}"))],
            body: String::new(),
        }
    }

    /// Builds a DISCONNECT frame requesting a closing receipt.
    #[must_use]
    pub fn disconnect() -> Self {
        Self {
            command: StompCommand::Disconnect,
            headers: vec![("receipt".to_string(), "disconnect".to_string())],
            body: String::new(),
        }
    }

    /// Returns the value of the first header named `name`, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Serializes the frame to its wire representation.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let escape = !self.command.is_connect_frame();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_ref());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NULL);
        out
    }

    /// Parses one frame from a WebSocket text message.
    ///
    /// Returns `Ok(None)` for heartbeat (EOL-only) messages.
    ///
    /// # Errors
    ///
    /// Returns [`StompError::Protocol`] if the command is unknown, a header
    /// line has no separator, or a header contains an invalid escape
    /// sequence.
    pub fn parse(text: &str) -> Result<Option<Self>, StompError> {
        if text.chars().all(|c| c == '\n' || c == '\r') {
            return Ok(None);
        }
        let trimmed = text.trim_end_matches(['\n', '\r']).trim_end_matches(NULL);

        let (head, body) = if let Some(idx) = trimmed.find("\r\n\r\n") {
            (&trimmed[..idx], &trimmed[idx + 4..])
        } else if let Some(idx) = trimmed.find("\n\n") {
            (&trimmed[..idx], &trimmed[idx + 2..])
        } else {
            (trimmed, "")
        };

        let mut lines = head.lines();
        let command_line = lines.next().unwrap_or_default().trim_end_matches('\r');
        let command: StompCommand = command_line
            .parse()
            .map_err(|_| StompError::Protocol(format!("unknown command: {command_line:?}")))?;

        let unescape_headers = !command.is_connect_frame();
        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                StompError::Protocol(format!("header line missing separator: {line:?}"))
            })?;
            if unescape_headers {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        Ok(Some(Self {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(StompError::Protocol(format!(
                    "invalid header escape sequence in {value:?} ({other:?})"
                )));
            }
        }
    }
    Ok(out)
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_connect_frame_wire_format() {
        let frame = StompFrame::connect(10_000, 10_000, &[("host".to_string(), "live".to_string())]);
        let wire = frame.to_wire();
        assert!(wire.starts_with("CONNECT\n"));
        assert!(wire.contains("accept-version:1.2\n"));
        assert!(wire.contains("heart-beat:10000,10000\n"));
        assert!(wire.contains("host:live\n"));
        assert!(wire.ends_with("\n\n\0"));
    }

    #[rstest]
    fn test_subscribe_unsubscribe_share_id() {
        let sub = StompFrame::subscribe(7, "/topic/room/42");
        assert_eq!(sub.header("id"), Some("sub-7"));
        assert_eq!(sub.header("destination"), Some("/topic/room/42"));

        let unsub = StompFrame::unsubscribe(7);
        assert_eq!(unsub.header("id"), Some("sub-7"));
    }

    #[rstest]
    fn test_roundtrip_message_frame() {
        let frame = StompFrame {
            command: StompCommand::Message,
            headers: vec![
                ("destination".to_string(), "/topic/room/42".to_string()),
                ("subscription".to_string(), "sub-1".to_string()),
            ],
            body: r#"{"sender":"u1","content":"hi"}"#.to_string(),
        };
        let parsed = StompFrame::parse(&frame.to_wire()).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[rstest]
    #[case("\n")]
    #[case("\r\n")]
    #[case("")]
    fn test_heartbeat_parses_to_none(#[case] text: &str) {
        assert_eq!(StompFrame::parse(text).unwrap(), None);
    }

    #[rstest]
    fn test_parse_tolerates_crlf_line_endings() {
        let wire = "MESSAGE\r\ndestination:/topic/a\r\n\r\nbody\0";
        let frame = StompFrame::parse(wire).unwrap().unwrap();
        assert_eq!(frame.command, StompCommand::Message);
        assert_eq!(frame.header("destination"), Some("/topic/a"));
        assert_eq!(frame.body, "body");
    }

    #[rstest]
    fn test_header_escaping_roundtrip() {
        let frame = StompFrame {
            command: StompCommand::Message,
            headers: vec![("reason".to_string(), "a:b\nc\\d".to_string())],
            body: String::new(),
        };
        let wire = frame.to_wire();
        assert!(wire.contains("reason:a\\cb\\nc\\\\d\n"));

        let parsed = StompFrame::parse(&wire).unwrap().unwrap();
        assert_eq!(parsed.header("reason"), Some("a:b\nc\\d"));
    }

    #[rstest]
    fn test_connected_headers_not_unescaped() {
        let wire = "CONNECTED\nversion:1.2\nserver:x\\y\n\n\0";
        let frame = StompFrame::parse(wire).unwrap().unwrap();
        // Backslash preserved verbatim on CONNECTED frames
        assert_eq!(frame.header("server"), Some("x\\y"));
    }

    #[rstest]
    fn test_unknown_command_rejected() {
        let result = StompFrame::parse("BOGUS\n\n\0");
        assert!(matches!(result, Err(StompError::Protocol(_))));
    }

    #[rstest]
    fn test_header_without_separator_rejected() {
        let result = StompFrame::parse("MESSAGE\nnot-a-header\n\nbody\0");
        assert!(matches!(result, Err(StompError::Protocol(_))));
    }

    #[rstest]
    fn test_invalid_escape_sequence_rejected() {
        let result = StompFrame::parse("MESSAGE\nk:bad\\tescape\n\n\0");
        assert!(matches!(result, Err(StompError::Protocol(_))));
    }

    #[rstest]
    fn test_body_preserves_interior_newlines() {
        let frame = StompFrame {
            command: StompCommand::Error,
            headers: vec![("message".to_string(), "boom".to_string())],
            body: "line one\nline two".to_string(),
        };
        let parsed = StompFrame::parse(&frame.to_wire()).unwrap().unwrap();
        assert_eq!(parsed.body, "line one\nline two");
    }

    #[rstest]
    fn test_first_header_wins_on_duplicates() {
        let wire = "MESSAGE\ndestination:/topic/a\ndestination:/topic/b\n\n\0";
        let frame = StompFrame::parse(wire).unwrap().unwrap();
        assert_eq!(frame.header("destination"), Some("/topic/a"));
    }
}
