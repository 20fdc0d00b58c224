//! Wire types for the BF Runtime management protocol.
//!
//! Generated by `tonic-build` from `proto/bfruntime.proto`, the subset of
//! the switch daemon's protocol the control plane speaks, plus the
//! `google.rpc.Status` envelope carried in `grpc-status-details-bin`.

use tonic::transport::Channel;

/// Generated protobuf types and gRPC service stubs.
pub mod bfrt_proto {
    tonic::include_proto!("bfrt_proto");
}

pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

pub use bfrt_proto::*;
pub use google::rpc::Status as RpcStatus;

/// Client for the `bfrt_proto.BfRuntime` service over a tonic channel.
pub type BfRuntimeClient = bf_runtime_client::BfRuntimeClient<Channel>;

/// Pipe id addressing every pipe of a device.
pub const ALL_PIPES: u32 = 0xFFFF;

/// Trailing-metadata key carrying a binary `google.rpc.Status`.
pub const STATUS_DETAILS_KEY: &str = "grpc-status-details-bin";
