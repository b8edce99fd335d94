use std::env;

const PATH_TO_LINKER_SCRIPT: &str = "linker.ld";

fn main() -> Result<(), String> {
    let path = env::current_dir()
        .map_err(|err| format!("Unable to access project directory: {err}"))?
        .into_os_string()
        .into_string()
        .map_err(|err| format!("Project directory path is not valid unicode (approximately {})", err.to_string_lossy()))?;

    // The production binary, and every `tests/*.rs` integration test plus
    // the library's own `#[cfg(test)]` harness, all link against the same
    // `virt_kernel::boot` stub and need the same bare-metal layout.
    println!("cargo:rustc-link-arg-bin=kernel=--script={path}/{PATH_TO_LINKER_SCRIPT}");
    println!("cargo:rustc-link-arg-bin=kernel=-n");
    println!("cargo:rustc-link-arg-tests=--script={path}/{PATH_TO_LINKER_SCRIPT}");
    println!("cargo:rustc-link-arg-tests=-n");

    match env::var("DEBUG").expect("Cargo should specify the `DEBUG` environment variable").as_str() {
        "false" => {
            println!("cargo:rustc-link-arg-bin=kernel=--oformat=binary");
            println!("cargo:rustc-link-arg=--strip-all");
        }
        "true" => {}
        _ => unreachable!(),
    }

    println!("cargo:rerun-if-changed={path}/{PATH_TO_LINKER_SCRIPT}");
    Ok(())
}
