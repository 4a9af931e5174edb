fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/hostnic.proto");

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // The generated messages double as persisted records (NIC status in the
    // local store), so they carry serde derives in addition to prost's.
    tonic_build::configure()
        .type_attribute(".hostnic", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile(&["proto/hostnic.proto"], &["proto"])?;

    Ok(())
}
