//! Server-side view instances and the connections that drive them.

mod connection;
mod outbox;
mod socket;
mod view;

pub use connection::{ClientInput, ConnectionState, Info};
pub use outbox::{Outbox, TransportErrorCallback, TransportReporter};
pub use socket::Socket;
pub use view::{JoinRequest, Joined, LiveView, Mailbox, MountRequest, Mountable, Params};

pub(crate) use connection::{parse_url, query_params};
