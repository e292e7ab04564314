//! ACN wire protocol and overlay transport.
//!
//! ## Architecture
//!
//! - **AcnMessage**: JSON-framed protocol messages (`register`, `lookup_request`,
//!   `lookup_response`, `envelope`, `status`)
//! - **protocol**: framed I/O and the register/lookup/envelope exchanges
//! - **por**: Proof-of-Representation validation of agent records
//! - **AddressRegistry**: thread-safe `address -> record, peer` index
//! - **Host**: transport/DHT capability the nodes are written against
//! - **MemoryNetwork**: in-process `Host` implementation

pub mod host;
pub mod memory;
pub mod message;
pub mod por;
pub mod protocol;
pub mod registry;

pub use host::{BoxedStream, Host, HostError, HostEvent, InboundStream, Multiaddr, StreamHandler};
pub use memory::{MemoryHost, MemoryNetwork};
pub use message::{AcnMessage, AcnPayload, PROTOCOL_VERSION};
pub use protocol::{WireError, MAX_MESSAGE_SIZE};
pub use registry::{AddressEntry, AddressRegistry, AnnouncementSet};
