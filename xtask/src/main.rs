//! trafficd build tasks
//!
//! The kernel programs need nightly Rust and bpf-linker, so they are built
//! here rather than by plain `cargo build`.
//!
//! Usage:
//!   cargo xtask build-ebpf              # Build the kernel object only
//!   cargo xtask build                   # Build everything (object + daemon)
//!   cargo xtask build-release           # Build release binaries
//!   cargo xtask install-object <PATH>   # Copy the built object to PATH
//!   cargo xtask clean                   # Clean build artifacts

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

const EBPF_BIN: &str = "trafficd-bpf";

fn main() -> Result<()> {
    let args: Vec<_> = std::env::args().skip(1).collect();

    match args.first().map(|s| s.as_str()) {
        Some("build-ebpf") => {
            build_ebpf(false)?;
        }
        Some("build") => {
            build_ebpf(false)?;
            build_main(false)?;
        }
        Some("build-release") => {
            build_ebpf(true)?;
            build_main(true)?;
        }
        Some("install-object") => {
            let dest = args
                .get(1)
                .context("install-object needs a destination path")?;
            install_object(Path::new(dest))?;
        }
        Some("clean") => clean()?,
        Some("help") | Some("--help") | Some("-h") => print_help(),
        _ => {
            print_help();
            anyhow::bail!("No command specified");
        }
    }

    Ok(())
}

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .unwrap_or(manifest_dir)
        .to_path_buf()
}

fn ebpf_dir() -> PathBuf {
    workspace_root().join("trafficd-ebpf")
}

fn built_object(release: bool) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    ebpf_dir()
        .join("target/bpfel-unknown-none")
        .join(profile)
        .join(EBPF_BIN)
}

/// Strategy for invoking nightly Rust
#[derive(Debug, Clone)]
enum NightlyStrategy {
    /// Plain cargo is already using nightly (common in NixOS)
    PlainCargoIsNightly,
    /// Need to explicitly use nightly cargo and rustc
    UseNightlyToolchain {
        cargo_path: PathBuf,
        rustc_path: PathBuf,
    },
}

fn rustup_which(tool: &str) -> Option<PathBuf> {
    let output = Command::new("rustup")
        .args(["which", "--toolchain", "nightly", tool])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(PathBuf::from(String::from_utf8_lossy(&output.stdout).trim()))
}

/// Detect how to invoke nightly Rust on this system
fn ensure_nightly_available() -> Result<NightlyStrategy> {
    if let Ok(output) = Command::new("rustc").arg("--version").output() {
        let version = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && version.contains("nightly") {
            println!("✓ Default rustc is nightly ({})", version.trim());
            return Ok(NightlyStrategy::PlainCargoIsNightly);
        }
    }

    if Command::new("rustup").arg("--version").output().is_ok() {
        let toolchains = Command::new("rustup")
            .args(["toolchain", "list"])
            .output()
            .context("Failed to run rustup")?;

        if !String::from_utf8_lossy(&toolchains.stdout).contains("nightly") {
            println!("⚠️  Nightly not found, installing via rustup...");
            let status = Command::new("rustup")
                .args(["toolchain", "install", "nightly", "--component", "rust-src"])
                .status()
                .context("Failed to run rustup")?;
            if !status.success() {
                anyhow::bail!("Failed to install nightly via rustup");
            }
        }

        if let (Some(cargo_path), Some(rustc_path)) = (rustup_which("cargo"), rustup_which("rustc"))
        {
            println!("  Using nightly toolchain from rustup");
            return Ok(NightlyStrategy::UseNightlyToolchain {
                cargo_path,
                rustc_path,
            });
        }
    }

    anyhow::bail!(
        "Nightly Rust not found!\n\
         \n\
         Install it with:\n\
         \x20\x20rustup toolchain install nightly --component rust-src"
    );
}

fn build_ebpf(release: bool) -> Result<PathBuf> {
    println!("🔨 Building kernel programs...");

    if Command::new("bpf-linker")
        .arg("--version")
        .output()
        .is_err()
    {
        anyhow::bail!(
            "bpf-linker not found!\n\
             \n\
             Install with:\n\
               cargo install bpf-linker"
        );
    }

    let mut cmd = match ensure_nightly_available()? {
        NightlyStrategy::PlainCargoIsNightly => Command::new("cargo"),
        NightlyStrategy::UseNightlyToolchain {
            cargo_path,
            rustc_path,
        } => {
            let mut cmd = Command::new(cargo_path);
            cmd.env("RUSTC", rustc_path);
            cmd
        }
    };

    cmd.current_dir(ebpf_dir())
        .arg("build")
        .args(["--target=bpfel-unknown-none"])
        .args(["-Z", "build-std=core"])
        .args(["--bin", EBPF_BIN])
        .env("RUSTFLAGS", "-C link-arg=--disable-memory-builtins");

    if release {
        cmd.arg("--release");
    }

    let status = cmd
        .status()
        .with_context(|| format!("Failed to run cargo for {}", EBPF_BIN))?;
    if !status.success() {
        anyhow::bail!("Failed to build {}", EBPF_BIN);
    }

    let object = built_object(release);
    println!("✅ Kernel object at: {}", object.display());
    Ok(object)
}

fn build_main(release: bool) -> Result<()> {
    println!("🔨 Building trafficd...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root())
        .args(["build", "-p", "trafficd", "--features", "bpf-programs"]);
    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("Failed to run cargo for trafficd")?;
    if !status.success() {
        anyhow::bail!("trafficd build failed");
    }

    println!("✅ Build complete");
    if release {
        let binary_path = workspace_root().join("target/release/trafficd");
        println!("\n📦 Release binary at: {}", binary_path.display());
    }
    Ok(())
}

fn install_object(dest: &Path) -> Result<()> {
    let object = built_object(true);
    if !object.exists() {
        anyhow::bail!(
            "{} not found, run `cargo xtask build-ebpf` with release first",
            object.display()
        );
    }

    if let Some(dir) = dest.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::copy(&object, dest)
        .with_context(|| format!("Failed to copy object to {}", dest.display()))?;

    println!("✅ Installed {} -> {}", object.display(), dest.display());
    Ok(())
}

fn clean() -> Result<()> {
    println!("🧹 Cleaning build artifacts...");

    for dir in [workspace_root(), ebpf_dir()] {
        let status = Command::new("cargo")
            .current_dir(&dir)
            .arg("clean")
            .status()
            .context("Failed to run cargo clean")?;
        if !status.success() {
            anyhow::bail!("Clean failed in {}", dir.display());
        }
    }

    println!("✅ Clean complete");
    Ok(())
}

fn print_help() {
    println!("trafficd build tasks\n");
    println!("USAGE:");
    println!("  cargo xtask <COMMAND>\n");
    println!("COMMANDS:");
    println!("  build-ebpf              Build the kernel object (requires nightly + bpf-linker)");
    println!("  build                   Build the kernel object and trafficd in debug mode");
    println!("  build-release           Build everything in release mode");
    println!("  install-object <PATH>   Copy the release kernel object to PATH");
    println!("  clean                   Clean all build artifacts");
    println!("  help                    Show this help message\n");
    println!("NOTES:");
    println!("  - `build` embeds the object into the trafficd binary (feature bpf-programs)");
    println!("  - Without an embedded object, trafficd loads the file named by bpf_object");
    println!("    in /etc/trafficd/config.json\n");
    println!("REQUIREMENTS:");
    println!("  - Rust nightly (auto-detected or auto-installed)");
    println!("  - bpf-linker: cargo install bpf-linker");
    println!("  - Linux kernel 4.9+ with cgroup v2 mounted");
}
