fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc_path = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc_path);

    prost_build::compile_protos(&["proto/remote_write.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/remote_write.proto");
    Ok(())
}
