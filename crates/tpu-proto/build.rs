use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    // Prefer a protoc from the environment, fall back to the vendored binary
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Client for the library, server for the loopback test service
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir)
        .compile_protos(&["proto/tpu_metric_service.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/tpu_metric_service.proto");

    Ok(())
}
