//! Client-side WebSocket framing
//!
//! Two wire modes. Clients that offer a `channel.k8s.io` subprotocol get
//! Kubernetes channel framing, where the first byte of every binary message
//! names the stream:
//! - 0: stdin
//! - 1: stdout
//! - 2: stderr
//! - 3: error / exit status
//! - 4: terminal resize (width LE u16, height LE u16)
//!
//! Everyone else gets plain framing: anything the client sends is stdin,
//! output goes out as binary messages and errors as text messages.

use axum::extract::ws::{CloseFrame, Message};
use axum::http::HeaderMap;
use serde_json::json;

use crate::sessions::CloseReason;
use crate::upstream::{ExitStatus, OutputStream};

/// Channel ids of the Kubernetes framing
pub mod channel {
    /// Stdin
    pub const STDIN: u8 = 0;
    /// Stdout
    pub const STDOUT: u8 = 1;
    /// Stderr
    pub const STDERR: u8 = 2;
    /// Error and exit status
    pub const ERROR: u8 = 3;
    /// Terminal resize
    pub const RESIZE: u8 = 4;
}

/// Subprotocols accepted for channel framing, most preferred first
pub const CHANNEL_PROTOCOLS: [&str; 4] = [
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL: u16 = 1011;
}

/// Wire mode of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Kubernetes channel framing
    Channel,
    /// Unframed
    Plain,
}

/// Decoded client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Bytes for the process's stdin
    Stdin(Vec<u8>),
    /// New terminal size
    Resize {
        /// Columns
        width: u16,
        /// Rows
        height: u16,
    },
    /// The client is closing
    Close,
    /// Nothing to forward (pings, empty or unknown frames)
    Ignore,
}

/// Message to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Process output
    Output(OutputStream, Vec<u8>),
    /// How the process ended
    Exit(ExitStatus),
    /// Error text
    Error(String),
}

impl FrameMode {
    /// Pick the mode from the client's `Sec-WebSocket-Protocol` offer
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let offers_channel = headers
            .get_all("sec-websocket-protocol")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|p| CHANNEL_PROTOCOLS.contains(&p.trim()));
        if offers_channel {
            FrameMode::Channel
        } else {
            FrameMode::Plain
        }
    }

    /// Decode one client message
    pub fn decode(&self, message: Message) -> ClientFrame {
        match (self, message) {
            (_, Message::Close(_)) => ClientFrame::Close,
            (_, Message::Ping(_)) | (_, Message::Pong(_)) => ClientFrame::Ignore,
            (FrameMode::Plain, Message::Text(text)) => ClientFrame::Stdin(text.as_bytes().to_vec()),
            (FrameMode::Plain, Message::Binary(data)) => ClientFrame::Stdin(data.to_vec()),
            (FrameMode::Channel, Message::Binary(data)) => decode_channel(&data),
            (FrameMode::Channel, Message::Text(text)) => decode_channel(text.as_bytes()),
        }
    }

    /// Encode one message for the client
    pub fn encode(&self, frame: ServerFrame) -> Message {
        match (self, frame) {
            (FrameMode::Channel, ServerFrame::Output(stream, data)) => {
                let id = match stream {
                    OutputStream::Stdout => channel::STDOUT,
                    OutputStream::Stderr => channel::STDERR,
                };
                Message::Binary(with_channel(id, &data).into())
            }
            (FrameMode::Plain, ServerFrame::Output(_, data)) => Message::Binary(data.into()),
            (FrameMode::Channel, ServerFrame::Exit(status)) => {
                Message::Binary(with_channel(channel::ERROR, exit_status_json(&status).as_bytes()).into())
            }
            (FrameMode::Plain, ServerFrame::Exit(status)) => {
                Message::Text(exit_status_text(&status).into())
            }
            (FrameMode::Channel, ServerFrame::Error(text)) => {
                Message::Binary(with_channel(channel::ERROR, text.as_bytes()).into())
            }
            (FrameMode::Plain, ServerFrame::Error(text)) => Message::Text(text.into()),
        }
    }
}

fn decode_channel(data: &[u8]) -> ClientFrame {
    let Some((&id, payload)) = data.split_first() else {
        return ClientFrame::Ignore;
    };
    match id {
        channel::STDIN => ClientFrame::Stdin(payload.to_vec()),
        channel::RESIZE if payload.len() >= 4 => ClientFrame::Resize {
            width: u16::from_le_bytes([payload[0], payload[1]]),
            height: u16::from_le_bytes([payload[2], payload[3]]),
        },
        other => {
            tracing::debug!(channel = other, "ignoring client frame on non-input channel");
            ClientFrame::Ignore
        }
    }
}

fn with_channel(id: u8, data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(1 + data.len());
    message.push(id);
    message.extend_from_slice(data);
    message
}

/// Exit status as a metav1.Status, the way the API server reports it on channel 3
fn exit_status_json(status: &ExitStatus) -> String {
    if status.success {
        return json!({"metadata": {}, "status": "Success"}).to_string();
    }
    let mut body = json!({
        "metadata": {},
        "status": "Failure",
        "message": status.message.clone().unwrap_or_else(|| "command failed".to_string()),
    });
    if let Some(code) = status.code {
        body["reason"] = json!("NonZeroExitCode");
        body["details"] = json!({
            "causes": [{"reason": "ExitCode", "message": code.to_string()}]
        });
    }
    body.to_string()
}

fn exit_status_text(status: &ExitStatus) -> String {
    match (status.success, status.code, &status.message) {
        (true, _, _) => "process exited".to_string(),
        (false, Some(code), _) => format!("process exited with code {}", code),
        (false, None, Some(message)) => format!("process failed: {}", message),
        (false, None, None) => "process failed".to_string(),
    }
}

/// Close frame for a session that ended for `reason`
pub fn close_frame(reason: &CloseReason) -> Message {
    let code = match reason {
        CloseReason::ClientClosed | CloseReason::UpstreamClosed => close_code::NORMAL,
        CloseReason::Error(_) => close_code::INTERNAL,
        _ => close_code::GOING_AWAY,
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.as_str().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_is_little_endian_width_then_height() {
        let frame = FrameMode::Channel.decode(Message::Binary(vec![4, 0x50, 0x00, 0x18, 0x00].into()));
        assert_eq!(frame, ClientFrame::Resize { width: 80, height: 24 });
    }

    #[test]
    fn short_resize_and_output_channels_are_ignored() {
        let mode = FrameMode::Channel;
        assert_eq!(mode.decode(Message::Binary(vec![4, 1].into())), ClientFrame::Ignore);
        assert_eq!(mode.decode(Message::Binary(vec![1, b'x'].into())), ClientFrame::Ignore);
        assert_eq!(mode.decode(Message::Binary(Vec::new().into())), ClientFrame::Ignore);
    }

    #[test]
    fn plain_mode_treats_everything_as_stdin() {
        let mode = FrameMode::Plain;
        assert_eq!(
            mode.decode(Message::Text("ls -la\n".into())),
            ClientFrame::Stdin(b"ls -la\n".to_vec())
        );
        assert_eq!(
            mode.decode(Message::Binary(vec![4, 0x50, 0, 0x18, 0].into())),
            ClientFrame::Stdin(vec![4, 0x50, 0, 0x18, 0])
        );
    }

    #[test]
    fn output_is_prefixed_only_in_channel_mode() {
        let chunk = ServerFrame::Output(OutputStream::Stderr, b"oops".to_vec());
        match FrameMode::Channel.encode(chunk.clone()) {
            Message::Binary(data) => assert_eq!(&data[..], b"\x02oops"),
            other => panic!("unexpected {other:?}"),
        }
        match FrameMode::Plain.encode(chunk) {
            Message::Binary(data) => assert_eq!(&data[..], b"oops"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_code_travels_as_status_cause() {
        let status = ExitStatus {
            success: false,
            code: Some(3),
            message: Some("command terminated with non-zero exit code".into()),
        };
        let Message::Binary(data) = FrameMode::Channel.encode(ServerFrame::Exit(status)) else {
            panic!("expected binary frame");
        };
        assert_eq!(data[0], channel::ERROR);
        let body: serde_json::Value = serde_json::from_slice(&data[1..]).unwrap();
        assert_eq!(body["status"], "Failure");
        assert_eq!(body["details"]["causes"][0]["message"], "3");
    }

    #[test]
    fn channel_mode_needs_a_channel_offer() {
        let mut headers = HeaderMap::new();
        assert_eq!(FrameMode::negotiate(&headers), FrameMode::Plain);

        headers.insert("sec-websocket-protocol", "base64.channel.k8s.io, v4.channel.k8s.io".parse().unwrap());
        assert_eq!(FrameMode::negotiate(&headers), FrameMode::Channel);
    }

    #[test]
    fn close_codes_follow_reason() {
        let Message::Close(Some(frame)) = close_frame(&CloseReason::IdleTimeout) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1001);
        assert_eq!(frame.reason.as_str(), CloseReason::IdleTimeout.as_str());
    }
}
