//! Exchange orchestration for bproxy.
//!
//! One inbound chat request flows: credential acquire → per-identity lock →
//! upstream call → diff-patch decode → OpenAI-compatible SSE projection.
//! Everything stateful lives in `bproxy-auth`; everything wire-shaped in
//! `bproxy-protocol`; this crate wires them around the upstream HTTP call.

pub mod engine;

pub use engine::{EngineConfig, EngineError, ExchangeEngine};
