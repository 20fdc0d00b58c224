fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
        // SAFETY: the build script is single-threaded.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/bfruntime.proto"], &["proto"])?;
    Ok(())
}
