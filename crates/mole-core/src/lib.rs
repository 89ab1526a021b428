//! mole-core: shared tunnel library for mole.
//!
//! Provides the CBOR envelope types and codec, the per-connection tunnel
//! registry, the sequenced reassembly engine, the frame writer, the tunnel
//! close protocol and the relay pumps that bind sockets and processes to
//! tunnels.

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod reassembly;
pub mod registry;
pub mod relay;
pub mod tunnel;
pub mod writer;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, frame_encode, read_frame, write_frame};
pub use connection::{Connection, ConnectionConfig};
pub use dispatch::{Dispatcher, Handler};
pub use error::{MoleError, MoleResult};
pub use messages::{DialStatus, Envelope, MsgType, PROTOCOL_VERSION};
pub use reassembly::{Chunk, Drain, Reassembly};
pub use registry::TunnelRegistry;
pub use tunnel::{Delivery, Tunnel, TunnelReceiver};
pub use writer::FrameWriter;
