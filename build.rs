use std::env;
use std::process::Command;

fn main() {
    let build_time = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();
    emit("BUILD_TIME", Some(build_time));

    // Git 信息，不在仓库中构建时为 unknown
    emit("GIT_HASH", command_output("git", &["rev-parse", "--short", "HEAD"]));
    emit(
        "GIT_BRANCH",
        command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]),
    );

    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    emit("RUST_VERSION", command_output(&rustc, &["--version"]));
    emit("TARGET_ARCH", env::var("TARGET").ok());
    emit("BUILD_PROFILE", env::var("PROFILE").ok());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");
}

fn emit(key: &str, value: Option<String>) {
    let value = value.unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env={}={}", key, value);
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
