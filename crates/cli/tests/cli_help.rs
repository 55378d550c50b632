use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn top_level_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("pathkeep");
    let out = cmd.arg("--help").assert().success().get_output().stdout.clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("remember"), "missing remember subcommand");
    assert!(text.contains("forget"), "missing forget subcommand");
    assert!(text.contains("daemon"), "missing daemon subcommand");
    assert!(text.contains("integrations"), "missing integrations subcommand");
}

#[test]
fn daemon_help_shows_start_and_status() {
    let mut cmd = cargo_bin_cmd!("pathkeep");
    let out = cmd
        .arg("daemon")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("start"), "daemon help missing start");
    assert!(text.contains("status"), "daemon help missing status");
}

#[test]
fn remember_help_shows_filter_flags() {
    let mut cmd = cargo_bin_cmd!("pathkeep");
    let out = cmd
        .arg("remember")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("--skip-ext"), "remember help missing --skip-ext");
    assert!(text.contains("--include-dir"), "remember help missing --include-dir");
}

#[test]
fn forget_requires_a_path_argument() {
    let mut cmd = cargo_bin_cmd!("pathkeep");
    cmd.arg("forget").assert().failure();
}
