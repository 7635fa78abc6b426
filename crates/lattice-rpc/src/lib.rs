//! JSON-RPC 2.0 plumbing shared by lattice services.
//!
//! This crate holds the wire-level pieces: the request/response envelope
//! types, the reserved error codes produced by the framework, a minimal
//! blocking HTTP/1.1 codec used by both the connector listener and the
//! metrics endpoint, and the outbound [`RpcClient`] that issues calls to peer
//! services.
//!
//! The protocol is JSON-RPC 2.0 over HTTP POST. Each exchange uses one
//! connection; responses carry either a `result` or an `error` object with a
//! numeric `code` and a `message`.

pub mod client;
pub mod envelope;
pub mod http;

pub use client::{CallError, ClientConfig, ClientTarget, RpcClient};
pub use envelope::{
    CODE_CRITICAL_INTERNAL, CODE_INTERNAL_SERVER, CODE_VALIDATION, RpcError, RpcRequest,
    RpcResponse, next_request_id,
};
pub use http::{HttpError, HttpRequest, HttpResponse};
