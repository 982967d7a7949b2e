fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds don't depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/binlog.proto", "proto/pump.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/binlog.proto");
    println!("cargo:rerun-if-changed=proto/pump.proto");
    Ok(())
}
