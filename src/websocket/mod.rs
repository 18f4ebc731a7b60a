mod handler;
mod message;
mod transport;
mod ws_transport;

pub use handler::{ws_handler, WsQuery};
pub use message::{ClientMessage, NegotiatedLimits, ServerMessage};
pub use transport::{CloseCode, Transport, TransportError};
pub use ws_transport::WsTransport;

#[cfg(test)]
pub(crate) use transport::mock;
