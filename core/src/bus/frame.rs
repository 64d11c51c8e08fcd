/// STOMP 1.2 frame codec for the message bus
use crate::error::{ChatError, Result};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::time::Duration;

/// Protocol version we negotiate
pub const STOMP_VERSION: &str = "1.2";

/// Frames larger than this are treated as a protocol violation
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
    Ack,
    Nack,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Result of decoding from the read buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A bare EOL sent as heartbeat
    Heartbeat,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Builder-style header append
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `key`; repeated headers keep the first occurrence
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| ChatError::Malformed(format!("frame body is not UTF-8: {}", e)))
    }

    /// CONNECT frame with heart-beat offer and optional bearer token
    pub fn connect(host: &str, token: Option<&str>, heart_beat: (u64, u64)) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{},{}", heart_beat.0, heart_beat.1));
        if let Some(token) = token {
            frame = frame
                .header("passcode", token)
                .header("Authorization", format!("Bearer {}", token));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn send_json(destination: &str, body: Vec<u8>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    /// Serialize to wire bytes, terminated by NUL
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.body.len());
        buf.extend_from_slice(self.command.as_str().as_bytes());
        buf.push(b'\n');

        let escape = self.command.escapes_headers();
        for (k, v) in &self.headers {
            if escape {
                buf.extend_from_slice(escape_header(k).as_bytes());
                buf.push(b':');
                buf.extend_from_slice(escape_header(v).as_bytes());
            } else {
                buf.extend_from_slice(k.as_bytes());
                buf.push(b':');
                buf.extend_from_slice(v.as_bytes());
            }
            buf.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            buf.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        buf.push(b'\n');
        buf.extend_from_slice(&self.body);
        buf.push(0);
        buf
    }

    /// Decode one frame (or heartbeat) from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf` only when a complete unit was decoded.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Decoded>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] == b'\n' {
            buf.advance(1);
            return Ok(Some(Decoded::Heartbeat));
        }
        if buf[0] == b'\r' {
            if buf.len() < 2 {
                return Ok(None);
            }
            if buf[1] == b'\n' {
                buf.advance(2);
                return Ok(Some(Decoded::Heartbeat));
            }
        }

        let (head_end, body_start) = match find_header_end(buf) {
            Some(found) => found,
            None => {
                if buf.len() > MAX_FRAME_SIZE {
                    return Err(ChatError::Protocol("frame header too large".to_string()));
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|e| ChatError::Protocol(format!("frame header is not UTF-8: {}", e)))?;
        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command_line = lines.next().unwrap_or_default();
        let command = Command::parse(command_line)
            .ok_or_else(|| ChatError::Protocol(format!("unknown command: {:?}", command_line)))?;

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| ChatError::Protocol(format!("bad header line: {:?}", line)))?;
            if command.escapes_headers() {
                headers.push((unescape_header(k)?, unescape_header(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| ChatError::Protocol(format!("bad content-length: {}", v)))
            })
            .transpose()?;

        let (body_end, frame_end) = match content_length {
            Some(len) => {
                if len > MAX_FRAME_SIZE {
                    return Err(ChatError::Protocol(format!("frame body too large: {}", len)));
                }
                let end = body_start + len;
                if buf.len() <= end {
                    return Ok(None);
                }
                if buf[end] != 0 {
                    return Err(ChatError::Protocol(
                        "frame body not NUL-terminated".to_string(),
                    ));
                }
                (end, end + 1)
            }
            None => match buf[body_start..].iter().position(|b| *b == 0) {
                Some(pos) => (body_start + pos, body_start + pos + 1),
                None => {
                    if buf.len() > MAX_FRAME_SIZE {
                        return Err(ChatError::Protocol("frame too large".to_string()));
                    }
                    return Ok(None);
                }
            },
        };

        let body = buf[body_start..body_end].to_vec();
        buf.advance(frame_end);
        Ok(Some(Decoded::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({}, {} bytes)", self.command, self.body.len())
    }
}

/// Position of the blank line ending the header block: (header bytes, body start)
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, b) in buf.iter().enumerate() {
        if *b != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        if line_start > 0 && (line.is_empty() || line == b"\r") {
            return Some((line_start, i + 1));
        }
        line_start = i + 1;
    }
    None
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(ChatError::Protocol(format!(
                    "undefined header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Parse a `heart-beat: cx,cy` header value (milliseconds)
pub fn parse_heart_beat(value: &str) -> Result<(u64, u64)> {
    let (a, b) = value
        .split_once(',')
        .ok_or_else(|| ChatError::Protocol(format!("bad heart-beat: {}", value)))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| ChatError::Protocol(format!("bad heart-beat: {}", value)))
    };
    Ok((parse(a)?, parse(b)?))
}

/// Negotiated (send every, expect within) intervals; `None` disables a direction
pub fn negotiate_heart_beat(
    ours: (u64, u64),
    theirs: (u64, u64),
) -> (Option<Duration>, Option<Duration>) {
    let send = if ours.0 == 0 || theirs.1 == 0 {
        None
    } else {
        Some(Duration::from_millis(ours.0.max(theirs.1)))
    };
    let expect = if ours.1 == 0 || theirs.0 == 0 {
        None
    } else {
        Some(Duration::from_millis(ours.1.max(theirs.0)))
    };
    (send, expect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_wire_format() {
        let frame = Frame::send_json("/app/send-message", b"{\"a\":1}".to_vec());
        let bytes = frame.encode();
        assert_eq!(
            bytes,
            b"SEND\ndestination:/app/send-message\ncontent-type:application/json\ncontent-length:7\n\n{\"a\":1}\0"
                .to_vec()
        );
    }

    #[test]
    fn test_decode_message_with_escaped_headers() {
        let wire = b"MESSAGE\r\ndestination:/topic/messages/u1\r\nmessage-id:a\\cb\r\nsubscription:sub-0\r\n\r\nhello\0".to_vec();
        let mut buf = BytesMut::from(&wire[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        let Decoded::Frame(frame) = decoded else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("message-id"), Some("a:b"));
        assert_eq!(frame.body_str().unwrap(), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let wire = Frame::new(Command::Receipt)
            .header("receipt-id", "r-1")
            .encode();
        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), wire.len() - 1);

        buf.extend_from_slice(&wire[wire.len() - 1..]);
        assert!(matches!(
            Frame::decode(&mut buf).unwrap(),
            Some(Decoded::Frame(_))
        ));
    }

    #[test]
    fn test_heartbeats_between_frames() {
        let mut wire = b"\n\r\n".to_vec();
        wire.extend(Frame::new(Command::Connected).header("version", "1.2").encode());
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(Decoded::Heartbeat));
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(Decoded::Heartbeat));
        assert!(matches!(
            Frame::decode(&mut buf).unwrap(),
            Some(Decoded::Frame(f)) if f.command == Command::Connected
        ));
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let frame = Frame::new(Command::Message).with_body(vec![b'a', 0, b'b']);
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let Some(Decoded::Frame(decoded)) = Frame::decode(&mut buf).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(decoded.body, vec![b'a', 0, b'b']);
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut buf = BytesMut::from(&b"BOGUS\n\n\0"[..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(ChatError::Protocol(_))
        ));
    }

    #[test]
    fn test_heart_beat_negotiation() {
        assert_eq!(parse_heart_beat("4000,10000").unwrap(), (4000, 10000));
        let (send, expect) = negotiate_heart_beat((4000, 4000), (10000, 0));
        assert_eq!(send, None);
        assert_eq!(expect, Some(Duration::from_millis(10000)));
    }
}
