mod tcp;
mod transport;

pub use tcp::TcpConnector;
pub use tcp::TcpTransport;
pub use transport::Connector;
pub use transport::Transport;
pub use transport::TransportError;
