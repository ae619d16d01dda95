use std::process::Command;

#[test]
fn rollerd_help_includes_usage() {
    let output = Command::new(env!("CARGO_BIN_EXE_rollerd"))
        .arg("--help")
        .output()
        .expect("failed to run rollerd --help");

    assert!(output.status.success(), "rollerd --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("rollerd") || stdout.contains("AutoRoll"),
        "expected help output to mention rollerd, got: {stdout}"
    );
    assert!(stdout.contains("--config"));
    assert!(stdout.contains("--workdir"));
}

#[test]
fn rollerd_rejects_missing_config_file() {
    let output = Command::new(env!("CARGO_BIN_EXE_rollerd"))
        .args(["--config", "/nonexistent/roller.toml"])
        .output()
        .expect("failed to run rollerd");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("loading config"),
        "expected a config error, got: {stderr}"
    );
}

#[test]
fn rollerd_version_matches_package() {
    let output = Command::new(env!("CARGO_BIN_EXE_rollerd"))
        .arg("--version")
        .output()
        .expect("failed to run rollerd --version");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
