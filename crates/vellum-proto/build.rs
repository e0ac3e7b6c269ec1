// ABOUTME: Build script for generating Rust code from vellum.proto.
// ABOUTME: Uses tonic-build to compile protobuf definitions into Rust types.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Servers are generated too so tests can stand up an in-process fake.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto-src/vellum.proto"], &["proto-src"])?;

    println!("cargo:rerun-if-changed=proto-src/vellum.proto");

    Ok(())
}
