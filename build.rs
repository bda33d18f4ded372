// Build script for proto compilation
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(false) // The harness is server only
        .compile(&["proto/audioharness.proto"], &["proto"])?;
    Ok(())
}
