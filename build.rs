fn main() {
    // `cargo test` links against the host target (there's no custom target
    // spec checked in here; the kernel image itself is built by passing
    // `--target` on the command line), and the host linker has no `_start`
    // at 0xffffffff80000000 for our `ENTRY(_start)` script to find. Only
    // apply it when we're actually cross-linking the freestanding kernel.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("-none") {
        println!("cargo:rustc-link-search=native={}", concat!(env!("CARGO_MANIFEST_DIR"), "/build"));
        println!("cargo:rustc-link-arg=-Tlinker.ld");
        println!("cargo:rerun-if-changed=build/linker.ld");
    }
}
