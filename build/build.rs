use std::env;
use std::path::Path;
use std::process::Command;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn main() {
    let label = format!(
        "tabmux {}",
        env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string())
    );
    println!("cargo:rustc-env=TABMUX_VERSION_LABEL={label}");
    println!("cargo:rustc-env=TABMUX_GIT_SHA={}", git_sha());
    println!("cargo:rustc-env=TABMUX_BUILD_TIME={}", build_time());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=TABMUX_BUILD_TIME");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}

fn git_sha() -> String {
    if let Ok(value) = env::var("GITHUB_SHA") {
        return value.trim().chars().take(7).collect();
    }
    if !Path::new(".git").exists() {
        return String::new();
    }
    let Some(sha) = git(&["rev-parse", "--short", "HEAD"]) else {
        return String::new();
    };
    let dirty = git(&["status", "--porcelain"]).is_some();
    if dirty { format!("{sha}-dirty") } else { sha }
}

fn build_time() -> String {
    if let Ok(value) = env::var("TABMUX_BUILD_TIME")
        && !value.trim().is_empty()
    {
        return value;
    }
    let stamp = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|epoch| OffsetDateTime::from_unix_timestamp(epoch).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    stamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Runs git and returns trimmed stdout, `None` on failure or empty output.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
