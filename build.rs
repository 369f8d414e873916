//! Stamp a build identifier for the startup banner.
//!
//! Release pipelines set `TONEBRIDGE_BUILD` to whatever they tag the
//! artifact with; local builds fall back to the crate version, suffixed
//! with the short commit hash when the sources live in a git checkout.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=TONEBRIDGE_BUILD");

    let build = std::env::var("TONEBRIDGE_BUILD").unwrap_or_else(|_| {
        let version =
            std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
        match short_commit() {
            Some(sha) => format!("{version}+{sha}"),
            None => version,
        }
    });
    println!("cargo:rustc-env=TONEBRIDGE_BUILD={build}");
}

fn short_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}
