//! Frame-level view of a chat connection.
//!
//! The session pumps only see [`Frame`]s, so they can run over an axum
//! WebSocket in production and over plain channels in tests.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping,
    Pong,
    Close,
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping => Message::Ping(Vec::new().into()),
            Frame::Pong => Message::Pong(Vec::new().into()),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Split an upgraded socket into a frame sink and a frame stream.
pub fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = axum::Error> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame, axum::Error>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(Message::from(frame))));
    let stream = stream.map(|msg| msg.map(Frame::from));
    (sink, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frames_survive_conversion() {
        let msg: Message = Frame::Text("{\"type\":\"CHAT\"}".into()).into();
        assert_eq!(Frame::from(msg), Frame::Text("{\"type\":\"CHAT\"}".into()));
        assert_eq!(Frame::from(Message::Close(None)), Frame::Close);
    }
}
