/// Message bus client: STOMP framing, transport, connection management
pub mod connection;
pub mod connector;
pub mod frame;

pub use connection::{inbox_topic, ConnectionManager, RESPONSES_QUEUE, SEND_DESTINATION};
pub use connector::{BusStream, Connector, TcpConnector};
pub use frame::{Command, Decoded, Frame};
