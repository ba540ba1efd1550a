//! Primitives shared by the Beach pier device relay: frame and client
//! identifiers, the broker registration protocol, dial-URL construction,
//! claim codes, reconnect backoff and the control-response envelope.
//!
//! Nothing in here touches sockets; the device crate owns all I/O.

mod backoff;
mod broker;
mod claim;
mod dial;
mod envelope;
mod frame;

pub use backoff::{Backoff, BackoffPolicy};
pub use broker::{classify_text, BrokerControl, Inbound, Registration};
pub use claim::{ClaimCode, ClaimStore, CLAIM_ALPHABET, CLAIM_CODE_LEN, CLAIM_TTL};
pub use dial::{device_dial_url, encode_component, DialUrlError};
pub use envelope::ControlResponse;
pub use frame::{ClientId, ConnectionState, Frame, TunnelConfig};
