//! Sensitive-data approval workflow engine: gRPC service composing the
//! rule matcher, flow selector, execution engine, gate, persistence
//! adapter and notifier.

#![deny(unsafe_code)]

pub mod authority;
pub mod convert;
pub mod engine;
pub mod gate;
pub mod grpc;

pub mod approval_v1 {
    tonic::include_proto!("approval.v1");
}

pub use engine::ExecutionEngine;
pub use gate::{ChangeExtractor, Gate, PreResolvedExtractor, Verdict};
pub use grpc::ApprovalEngineService;
