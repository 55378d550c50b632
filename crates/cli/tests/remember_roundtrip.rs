use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::tempdir;

#[test]
fn remember_then_list_then_forget_round_trips() {
    let registry_dir = tempdir().unwrap();
    let db_path = registry_dir.path().join("registry.db");
    let remembered_dir = tempdir().unwrap();

    let mut remember = cargo_bin_cmd!("pathkeep");
    remember
        .arg("--db-path")
        .arg(&db_path)
        .arg("remember")
        .arg(remembered_dir.path())
        .assert()
        .success();

    let mut list = cargo_bin_cmd!("pathkeep");
    let out = list.arg("--db-path").arg(&db_path).arg("list").assert().success().get_output().stdout.clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains(&remembered_dir.path().display().to_string()));

    let mut forget = cargo_bin_cmd!("pathkeep");
    forget.arg("--db-path").arg(&db_path).arg("forget").arg(remembered_dir.path()).assert().success();

    let mut list_again = cargo_bin_cmd!("pathkeep");
    let out = list_again.arg("--db-path").arg(&db_path).arg("list").assert().success().get_output().stdout.clone();
    assert!(!String::from_utf8_lossy(&out).contains(&remembered_dir.path().display().to_string()));
}

#[test]
fn remembering_the_same_path_twice_fails() {
    let registry_dir = tempdir().unwrap();
    let db_path = registry_dir.path().join("registry.db");
    let remembered_dir = tempdir().unwrap();

    let mut first = cargo_bin_cmd!("pathkeep");
    first.arg("--db-path").arg(&db_path).arg("remember").arg(remembered_dir.path()).assert().success();

    let mut second = cargo_bin_cmd!("pathkeep");
    second.arg("--db-path").arg(&db_path).arg("remember").arg(remembered_dir.path()).assert().failure();
}
