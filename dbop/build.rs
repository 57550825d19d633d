// Reject lint-suppression attributes ("#[" + "allow" + ...) in dbop sources, tests and benches.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-env-changed=DBOP_CHECK_NO_ALLOW");

    // Run the check unless explicitly disabled (e.g., DBOP_CHECK_NO_ALLOW=0).
    if env::var("DBOP_CHECK_NO_ALLOW").is_ok_and(|v| v == "0") {
        return;
    }

    let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR").map(PathBuf::from) else {
        return;
    };

    let mut violations = Vec::new();
    for relative in ["src", "tests", "benches"] {
        let path = manifest_dir.join(relative);
        println!("cargo:rerun-if-changed={}", path.display());
        if path.exists() {
            scan_path(&path, &mut violations);
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes detected in dbop:");
    for (file, line, content) in &violations {
        eprintln!("  {}:{}: {}", file.display(), line, content.trim());
    }
    panic!("lint suppression attributes are forbidden in dbop; use #[expect(..., reason = ...)]");
}

fn scan_path(path: &Path, violations: &mut Vec<(PathBuf, usize, String)>) {
    if path.is_dir() {
        if path.ends_with("target") {
            return;
        }
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            scan_path(&entry.path(), violations);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }

    if let Ok(content) = fs::read_to_string(path) {
        for (idx, line) in content.lines().enumerate() {
            if line.contains("#[allow") || line.contains("#![allow") {
                violations.push((path.to_path_buf(), idx + 1, line.to_string()));
            }
        }
    }
}
