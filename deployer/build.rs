//! Build script for fleetroll
//!
//! Embeds the commit and build time reported by `fleetroll version`.

use std::process::Command;

use chrono::{SecondsFormat, Utc};

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string()).filter(|t| !t.is_empty())
}

fn main() {
    // same length as the build id used to tag fleet groups
    let git_hash = git(&["rev-parse", "--short=7", "HEAD"]).unwrap_or_else(|| "unknown".into());
    let build_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    println!("cargo:rustc-env=FLEETROLL_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=FLEETROLL_BUILD_TIME={}", build_time);

    if let Some(head) = git(&["rev-parse", "--git-path", "HEAD"]) {
        println!("cargo:rerun-if-changed={}", head);
    }
    println!("cargo:rerun-if-changed=build.rs");
}
