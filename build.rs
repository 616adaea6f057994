//! Build script: library search path for the optional BEAGLE backend.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=BEAGLE_LIB_DIR");

    if std::env::var("CARGO_FEATURE_BEAGLE").is_err() {
        return;
    }

    match std::env::var("BEAGLE_LIB_DIR") {
        Ok(dir) => println!("cargo:rustc-link-search=native={dir}"),
        Err(_) => {
            let default = "/usr/local/lib";
            if std::path::Path::new(default).exists() {
                println!("cargo:rustc-link-search=native={default}");
            } else {
                println!("cargo:warning=BEAGLE_LIB_DIR not set, relying on the system library path");
            }
        }
    }
}
