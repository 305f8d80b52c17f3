fn main() -> std::io::Result<()> {
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc_path) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc_path);
        }
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/vole.proto"], &["proto/"])?;
    Ok(())
}
