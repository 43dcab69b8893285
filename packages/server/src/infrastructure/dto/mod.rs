//! Wire protocol DTOs: the `{op, d}` envelope, the closed set of inbound
//! operations, and outbound event payloads.

pub mod websocket;
