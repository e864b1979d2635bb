//! Core domain types for the Patchbay capability router.
//!
//! This crate defines the wire protocol (messages, error envelopes, trace
//! annotation), the self-description metadata that capability providers
//! register with, and the `CapabilityNode` trait that in-process providers
//! implement. Everything that flows between the router, the registry, and
//! the nodes passes through these types.

pub mod error;
pub mod metadata;
pub mod node;
pub mod protocol;

pub use error::ErrorCode;
pub use metadata::{
    CapabilityMetadata, Idempotency, NodeDescriptor, RiskClass, SideEffectScope, parse_version,
};
pub use node::{CapabilityNode, RouteFn, RouteFuture};
pub use protocol::{
    Message, PROTOCOL_VERSION, ensure_trace, looks_like_protocol, make_error, make_error_with,
    make_response, new_uuid, now_iso, validate_core,
};
