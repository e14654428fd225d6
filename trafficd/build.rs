use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo::rustc-check-cfg=cfg(bpf_programs_built)");

    // Only build the kernel programs if the feature is enabled
    if env::var("CARGO_FEATURE_BPF_PROGRAMS").is_err() {
        return;
    }

    println!("cargo:rerun-if-changed=../trafficd-ebpf/src");
    println!("cargo:rerun-if-changed=../trafficd-common/src");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let workspace_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap())
        .parent()
        .unwrap()
        .to_path_buf();

    if !check_bpf_linker_installed() {
        println!("cargo:warning=bpf-linker not found - kernel programs will not be embedded");
        print_ebpf_build_instructions();
        return;
    }

    match build_bpf_object(&workspace_root, &out_dir) {
        Ok(object) => {
            // Tell the loader where to find the object to embed
            println!(
                "cargo:rustc-env=TRAFFICD_BPF_OBJECT_PATH={}",
                object.display()
            );
            println!("cargo:rustc-cfg=bpf_programs_built");
        }
        Err(e) => {
            println!("cargo:warning=Failed to build kernel programs:");
            for line in e.lines() {
                println!("cargo:warning=  {}", line);
            }
            println!("cargo:warning=");
            println!("cargo:warning=trafficd will load the object named in its config instead");
            print_ebpf_build_instructions();
        }
    }
}

fn check_bpf_linker_installed() -> bool {
    Command::new("bpf-linker").arg("--version").output().is_ok()
}

fn build_bpf_object(workspace_root: &Path, out_dir: &Path) -> Result<PathBuf, String> {
    let ebpf_dir = workspace_root.join("trafficd-ebpf");

    let output = Command::new("cargo")
        .current_dir(&ebpf_dir)
        .args([
            "build",
            "--release",
            "--target=bpfel-unknown-none",
            "-Z",
            "build-std=core",
            "--bin",
            "trafficd-bpf",
        ])
        .env("RUSTFLAGS", "-C link-arg=--disable-memory-sanitizer")
        .output()
        .map_err(|e| format!("Failed to execute cargo: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(format!(
            "Failed to build trafficd-bpf:\n\nSTDOUT:\n{}\n\nSTDERR:\n{}",
            stdout, stderr
        ));
    }

    let built = ebpf_dir.join("target/bpfel-unknown-none/release/trafficd-bpf");
    let object = out_dir.join("trafficd-bpf.o");
    std::fs::copy(&built, &object)
        .map_err(|e| format!("Failed to copy {}: {}", built.display(), e))?;

    Ok(object)
}

fn print_ebpf_build_instructions() {
    println!("cargo:warning=");
    println!("cargo:warning=To embed the kernel programs:");
    println!("cargo:warning=1. Install bpf-linker: cargo install bpf-linker");
    println!("cargo:warning=2. Install rust-src: rustup component add rust-src --toolchain nightly");
    println!("cargo:warning=3. Rebuild: cargo xtask build");
    println!("cargo:warning=");
    println!("cargo:warning=Or build the object manually and point bpf_object at it:");
    println!("cargo:warning=  cd trafficd-ebpf");
    println!("cargo:warning=  cargo build --release --target bpfel-unknown-none -Z build-std=core");
    println!("cargo:warning=");
}
