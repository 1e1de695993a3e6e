//! Generated protobuf/gRPC types for the `ms_serving` package (§6),
//! compiled from `proto/ms_serving.proto` by `build.rs`.
tonic::include_proto!("ms_serving");
