fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Messages are plain prost structs in src/proto.rs, so only the service
    // glue is generated here and no protoc is needed at build time.
    let metrics = tonic_build::manual::Service::builder()
        .name("Metrics")
        .package("tally")
        .method(
            tonic_build::manual::Method::builder()
                .name("save_metrics")
                .route_name("SaveMetrics")
                .input_type("crate::proto::MetricProto")
                .output_type("crate::proto::SaveAck")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[metrics]);
}
