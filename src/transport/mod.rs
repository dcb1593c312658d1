//! Alternate transports
//!
//! The connection handler is generic over `AsyncRead + AsyncWrite`; this
//! module provides the WebSocket adapter that lets MQTT-over-WebSocket
//! clients share it with plain TCP and TLS.

mod websocket;

pub use websocket::WsStream;
