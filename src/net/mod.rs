//! TCP building blocks on top of the event loop: the accept and connect
//! state machines, the connection object, and the server/client façades
//! that wire them to a loop pool and user callbacks.

pub mod acceptor;
pub mod client;
pub mod connection;
pub mod connector;
pub mod server;

pub use self::acceptor::Acceptor;
pub use self::client::TcpClient;
pub use self::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use self::connector::Connector;
pub use self::server::TcpServer;
