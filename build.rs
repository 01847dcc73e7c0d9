fn main() {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "debug".to_string());

    // libtorch downloaded by torch-sys lands under the build output dir
    let pattern = format!(
        "{manifest_dir}/target/{profile}/build/torch-sys-*/out/libtorch/libtorch/lib",
        manifest_dir = manifest_dir,
        profile = profile
    );

    let torch_path = glob::glob(&pattern)
        .ok()
        .and_then(|mut paths| paths.next())
        .and_then(|entry| entry.ok());

    if let Some(path) = torch_path.as_ref().and_then(|p| p.to_str()) {
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path);
    }
}
