#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::process::Command;

use tempfile::TempDir;

fn troika() -> Command {
    Command::new(env!("CARGO_BIN_EXE_troika"))
}

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("troika.yml");
    std::fs::write(
        &path,
        "sites:\n  local:\n    type: slurm\n    connection: local\n  direct:\n    type: direct\n    connection: local\n",
    )
    .unwrap();
    path
}

#[test]
fn submit_rewrites_script_and_exits_zero() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let script = dir.path().join("job.sh");
    std::fs::write(&script, "#!/usr/bin/env bash\necho \"Hello, World!\"\n").unwrap();
    let output_path = dir.path().join("out.log");

    let output = troika()
        .args(["-c"])
        .arg(&config)
        .args(["-n", "submit", "local"])
        .arg(&script)
        .args(["-o"])
        .arg(&output_path)
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn list_sites_enumerates_configuration() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let output = troika().args(["-c"]).arg(&config).args(["list-sites"]).output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("local"), "missing local site:\n{stdout}");
    assert!(stdout.contains("direct"), "missing direct site:\n{stdout}");
}

#[test]
fn unknown_site_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let script = dir.path().join("job.sh");
    std::fs::write(&script, "echo hi\n").unwrap();
    let output_path = dir.path().join("out.log");

    let output = troika()
        .args(["-c"])
        .arg(&config)
        .args(["submit", "nope"])
        .arg(&script)
        .args(["-o"])
        .arg(&output_path)
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn missing_config_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let output = troika()
        .env_remove("TROIKA_CONFIG_FILE")
        .current_dir(dir.path())
        .args(["list-sites"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn kill_with_invalid_jid_file_is_a_run_error() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let script = dir.path().join("job.sh");
    std::fs::write(&script, "echo hi\n").unwrap();
    std::fs::write(dir.path().join("job.sh.jid"), "not-a-number\n").unwrap();
    let output_path = dir.path().join("out.log");

    let output = troika()
        .args(["-c"])
        .arg(&config)
        .args(["kill", "direct"])
        .arg(&script)
        .args(["-o"])
        .arg(&output_path)
        .output()
        .unwrap();

    assert!(!output.status.success());
}
