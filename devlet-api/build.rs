// Code generation for gRPC protobuf definitions

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Supply a protoc binary from a vendored crate when one is not already
    // available on the system, so codegen works in minimal build environments.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/deviceplugin.proto"], &["proto"])?;
    Ok(())
}
