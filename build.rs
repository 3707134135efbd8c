//! Build script - copies the linker script into the output directory
//! so that the linker can find it at link time.
//!
//! Host builds (library tests) do not link against `memory.x`, so the
//! copy only happens for bare-metal ARM targets.

use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");

    let target = env::var("TARGET").unwrap_or_default();
    if !target.starts_with("thumb") {
        return;
    }

    let Some(out_dir) = env::var_os("OUT_DIR").map(PathBuf::from) else {
        println!("cargo:warning=OUT_DIR not set, linker script not copied");
        return;
    };

    // Copy memory.x to OUT_DIR
    if let Err(e) = fs::copy("memory.x", out_dir.join("memory.x")) {
        println!("cargo:warning=failed to copy memory.x: {e}");
        return;
    }

    // Tell cargo to look for linker scripts in OUT_DIR
    println!("cargo:rustc-link-search={}", out_dir.display());
}
