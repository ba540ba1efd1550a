//! Device side of Beach pier: LAN WebSocket relays, the JSON control
//! protocol, and the outbound cloud tunnel that lets a remote UI reach the
//! device through the broker.

pub mod control;
pub mod device;
pub mod endpoint;
pub mod media;
pub mod outbound;
pub mod relays;
pub mod tunnel;
