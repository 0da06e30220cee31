use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/");

    let Ok(crate_dir) = env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let output_file = target_dir(&crate_dir).join("shmem_connect.h");

    let generated = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_pragma_once(true)
        .with_documentation(true)
        .with_include_guard("SHMEM_CONNECT_H")
        .with_include_version(true)
        .generate();

    match generated {
        Ok(bindings) => {
            bindings.write_to_file(&output_file);
            println!("cargo:warning=Generated C header: {}", output_file.display());
        }
        Err(e) => println!("cargo:warning=C header not generated: {e}"),
    }
}

fn target_dir(crate_dir: &str) -> PathBuf {
    match env::var("CARGO_TARGET_DIR") {
        Ok(target) => PathBuf::from(target).join("include"),
        Err(_) => PathBuf::from(crate_dir)
            .join("../../target")
            .join("include"),
    }
}
