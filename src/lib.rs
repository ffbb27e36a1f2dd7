//! A peer session core: named-extension multiplexing, request/response
//! envelope framing, and a built-in init veto gate over a duplex transport.
//!
//! The transport layer (discovery, dialing, wire framing) is an external
//! collaborator — see [`transport::Transport`] — so this crate owns only the
//! session lifecycle, the extension registry, and the envelope codec.

pub mod codec;
pub mod error;
pub mod extension;
pub mod session;
pub mod transport;

pub use codec::{Codec, Envelope, Json, Options, Schema, WireError};
pub use error::ProtocolError;
pub use extension::init::{InitExtension, InitSymbol, INIT_EXTENSION_NAME};
pub use extension::{Extension, ExtensionObject, ExtensionState, Stats};
pub use session::{Context, Session, SessionEvent, SessionOptions};
pub use transport::{PipeTransport, Transport, TransportEvent};
