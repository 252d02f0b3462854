//! Translation between websocket transport messages and text payloads.

use std::borrow::Cow;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Reason sent with the normal-closure frame on shutdown.
pub const CLOSE_REASON: &str = "Closing";

/// Inbound frame after decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload for the dispatcher.
    Text(String),
    /// Peer started the closing handshake.
    Close {
        /// Close code, absent for a bare close frame.
        code: Option<u16>,
        /// Reason text, empty when the peer sent none.
        reason: String,
    },
    /// Keepalive probe; the payload is echoed back in a pong.
    Ping(Vec<u8>),
    /// Keepalive reply.
    Pong,
    /// Binary payload that is not valid UTF-8.
    Undecodable { len: usize },
}

/// Decodes a transport message.
///
/// Binary frames are accepted when they carry valid UTF-8, since the node
/// only ever speaks JSON.
pub fn decode(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Frame::Text(text),
            Err(err) => Frame::Undecodable {
                len: err.as_bytes().len(),
            },
        },
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(_) => Frame::Pong,
        Message::Close(frame) => match frame {
            Some(frame) => Frame::Close {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.into_owned(),
            },
            None => Frame::Close {
                code: None,
                reason: String::new(),
            },
        },
        // Raw frames are never yielded when reading.
        Message::Frame(_) => Frame::Undecodable { len: 0 },
    }
}

/// Normal-closure (1000) frame used for orderly shutdown.
pub fn normal_close() -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(CLOSE_REASON),
    }
}
