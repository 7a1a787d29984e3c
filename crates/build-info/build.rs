use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=COORD_BUILD_ID_OVERRIDE");

    // The workspace root sits two levels above this crate.
    let git_dir = Path::new("../../.git");
    for watched in watched_git_files(git_dir) {
        println!("cargo:rerun-if-changed={}", watched);
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_describe().unwrap_or_else(|| {
        format!("v{}", env::var("CARGO_PKG_VERSION").unwrap_or_default())
    });
    let build_id = env::var("COORD_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=COORD_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=COORD_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=COORD_BUILD_GIT={}", git_label);
}

fn watched_git_files(git_dir: &Path) -> Vec<String> {
    let head = git_dir.join("HEAD");
    let Ok(head_ref) = fs::read_to_string(&head) else {
        return Vec::new();
    };

    let mut watched = vec![head.display().to_string()];
    if let Some(reference) = head_ref.strip_prefix("ref: ") {
        let ref_path = git_dir.join(reference.trim());
        if ref_path.exists() {
            watched.push(ref_path.display().to_string());
        }
    }
    watched
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
