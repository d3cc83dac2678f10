//! Build script for crosslocale.
//!
//! Annotates the crate version with the commit it was built from.

use std::process::Command;

fn main() {
    let version = env!("CARGO_PKG_VERSION");

    // "<short hash> <commit date>", absent outside a git checkout
    let commit = Command::new("git")
        .args(["log", "-1", "--date=short", "--pretty=format:%h %cd"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).replace('\n', ""))
        .filter(|c| !c.trim().is_empty());

    if let Some(commit) = commit {
        println!("cargo:rustc-env=CROSSLOCALE_NICE_VERSION={version} ({commit})");
    }

    // Rebuild if git HEAD changes
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs");
}
