pub(crate) mod connector;
pub(crate) mod stream;

pub use connector::{PollEvent, SendBehavior, TcpConnector};
pub use stream::{ConnState, TcpStream, TcpTelemetry};
