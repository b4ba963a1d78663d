// build.rs
fn main() {
    // Build info for the diagnostics endpoint. Probe objects are produced by a
    // separate toolchain and shipped next to the binary, so nothing is compiled here.
    if let Err(e) = vergen::EmitBuilder::builder()
        .all_build()
        .git_sha(true)
        .emit()
    {
        println!("cargo:warning=Unable to generate build info: {}", e);
    }
}
