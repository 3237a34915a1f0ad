/// Generates the gRPC client and server bindings for `proto/genid.proto`.
///
/// The encoded file descriptor set is written next to the generated code so
/// the server can register it with `tonic-reflection`.
///
/// # Panics
///
/// Panics if `OUT_DIR` is unset or code generation fails; both abort the build.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("genid_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/genid.proto"], &["proto"])
        .unwrap();
}
