extern crate tonic_build;

fn main() {
    // all sma protos share one package and end up in a single file
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile(
            &[
                "proto/sma.proto",
                "proto/nvme.proto",
                "proto/virtio_blk.proto",
                "proto/nvmf_tcp.proto",
                "proto/nvmf.proto",
            ],
            &["proto"],
        )
        .unwrap_or_else(|e| panic!("sma protobuf compilation failed: {}", e));
}
