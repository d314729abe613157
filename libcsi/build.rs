fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single threaded at this point.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }
    let well_known = protoc_bin_vendored::include_path()?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/csi.proto"], &[std::path::PathBuf::from("proto"), well_known])?;
    Ok(())
}
