use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/types.rs");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let out = crate_dir.join("include").join("embed_http.h");

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("EMBED_HTTP_H".to_string()),
        cpp_compat: true,
        ..Default::default()
    };

    // A header is a convenience; never fail the library build over it.
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(out);
        }
        Err(e) => println!("cargo:warning=skipping header generation: {e}"),
    }
}
