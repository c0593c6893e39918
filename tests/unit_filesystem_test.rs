mod common;

use helmsman::core::errors::{ErrorKind, is_error_code};
use helmsman::core::filesystem::Filesystem;
use std::path::Path;
use std::time::Duration;

fn build_fs(root: &Path, quota: u64, denylist: Vec<String>) -> Filesystem {
    Filesystem::new(
        root,
        quota,
        denylist,
        common::current_user(),
        Duration::from_secs(150),
        Duration::from_secs(300),
    )
    .unwrap()
}

#[tokio::test]
async fn test_traversal_outside_root_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);

    for path in [
        "../../etc/passwd",
        "/etc/../../etc/passwd",
        "../sibling",
        "a/../../../etc/shadow",
    ] {
        let err = fs.stat(path).unwrap_err();
        assert!(
            is_error_code(&err, ErrorKind::PathResolution),
            "{path} should fail path resolution, got {err:?}"
        );
    }
}

#[tokio::test]
async fn test_symlink_never_allows_escape() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

    let fs = build_fs(dir.path(), 0, vec![]);
    std::os::unix::fs::symlink(outside.path(), fs.path().join("link")).unwrap();

    let err = fs
        .write_file("link/evil.txt", &b"payload"[..])
        .await
        .unwrap_err();
    assert!(is_error_code(&err, ErrorKind::PathResolution));

    let err = fs.stat("link/secret.txt").unwrap_err();
    assert!(is_error_code(&err, ErrorKind::PathResolution));
}

#[tokio::test]
async fn test_deleting_symlink_removes_only_the_link() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("keep.txt"), "keep").unwrap();

    let fs = build_fs(dir.path(), 0, vec![]);
    std::os::unix::fs::symlink(outside.path(), fs.path().join("link")).unwrap();

    fs.delete("link").await.unwrap();
    assert!(!fs.path().join("link").exists());
    assert!(outside.path().join("keep.txt").exists());
}

#[tokio::test]
async fn test_write_and_delete_adjust_usage() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);

    fs.write_file("data.bin", &[7u8; 1000][..]).await.unwrap();
    assert_eq!(fs.cached_usage(), 1000);

    // Overwriting charges only the delta.
    fs.write_file("data.bin", &[7u8; 400][..]).await.unwrap();
    assert_eq!(fs.cached_usage(), 400);

    fs.delete("data.bin").await.unwrap();
    assert_eq!(fs.cached_usage(), 0);

    // A full walk agrees with the incremental accounting.
    assert_eq!(fs.recompute_usage().await, 0);
}

#[tokio::test]
async fn test_quota_boundary_exact_fit() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 100, vec![]);

    // Exactly the quota fits.
    fs.write_file("fill.bin", &[0u8; 100][..]).await.unwrap();
    assert_eq!(fs.cached_usage(), 100);

    // One more byte does not, and no partial file is left behind.
    let err = fs.write_file("extra.bin", &[0u8; 1][..]).await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::DiskSpace));
    assert!(!fs.path().join("extra.bin").exists());
    assert_eq!(fs.cached_usage(), 100);
}

#[tokio::test]
async fn test_has_space_for_known_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 50, vec![]);

    fs.write_file("a.bin", &[1u8; 20][..]).await.unwrap();
    assert!(fs.has_space_for(30).is_ok());
    assert!(fs.has_space_for(31).is_err());

    // Quota 0 means unlimited.
    let unlimited = build_fs(tempfile::tempdir().unwrap().path(), 0, vec![]);
    assert!(unlimited.has_space_for(u64::MAX).is_ok());
}

#[tokio::test]
async fn test_rename_to_existing_destination_mutates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);

    fs.write_file("from.txt", &b"source"[..]).await.unwrap();
    fs.write_file("to.txt", &b"destination"[..]).await.unwrap();

    let err = fs.rename("from.txt", "to.txt").await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::AlreadyExists));
    assert_eq!(std::fs::read(fs.path().join("from.txt")).unwrap(), b"source");
    assert_eq!(
        std::fs::read(fs.path().join("to.txt")).unwrap(),
        b"destination"
    );
}

#[tokio::test]
async fn test_rename_creates_destination_parents() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);

    fs.write_file("file.txt", &b"x"[..]).await.unwrap();
    fs.rename("file.txt", "nested/deep/file.txt").await.unwrap();
    assert!(fs.path().join("nested/deep/file.txt").is_file());
}

#[tokio::test]
async fn test_denylist_blocks_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec!["*.jar".to_string(), "configs/*".to_string()]);

    let err = fs.write_file("server.jar", &b"x"[..]).await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::DenylistFile));

    std::fs::create_dir_all(fs.path().join("configs")).unwrap();
    std::fs::write(fs.path().join("configs/ops.json"), "[]").unwrap();

    let err = fs.delete("configs/ops.json").await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::DenylistFile));

    let err = fs.chmod("configs/ops.json", 0o777).await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::DenylistFile));

    // Both rename endpoints are checked.
    std::fs::write(fs.path().join("plain.txt"), "x").unwrap();
    let err = fs.rename("plain.txt", "evil.jar").await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::DenylistFile));

    // Reads are not the denylist's concern.
    assert!(fs.stat("configs/ops.json").is_ok());
}

#[tokio::test]
async fn test_copy_picks_free_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);

    fs.write_file("map.dat", &b"world"[..]).await.unwrap();
    fs.copy("map.dat").await.unwrap();
    fs.copy("map.dat").await.unwrap();

    assert!(fs.path().join("map copy.dat").is_file());
    assert!(fs.path().join("map copy 2.dat").is_file());
    assert_eq!(fs.cached_usage(), 15);
}

#[tokio::test]
async fn test_list_directory_sorts_directories_first() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);

    fs.write_file("zeta.txt", &b"z"[..]).await.unwrap();
    fs.write_file("alpha.txt", &b"a"[..]).await.unwrap();
    fs.create_directory("world", "").await.unwrap();

    let entries = fs.list_directory("").unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["world", "alpha.txt", "zeta.txt"]);
    assert!(entries[0].directory);
}

#[tokio::test]
async fn test_file_rejects_directories() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);
    fs.create_directory("sub", "").await.unwrap();

    let err = fs.file("sub").await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::IsDirectory));

    let err = fs.stat("missing.txt").unwrap_err();
    assert!(is_error_code(&err, ErrorKind::NotExist));
}

#[tokio::test]
async fn test_chmod_applies_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0, vec![]);
    fs.write_file("run.sh", &b"#!/bin/sh"[..]).await.unwrap();

    fs.chmod("run.sh", 0o755).await.unwrap();
    let mode = fs.path().join("run.sh").metadata().unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o755);

    let info = fs.stat("run.sh").unwrap();
    assert_eq!(info.mode, 0o755);
    assert_eq!(info.mode_string, "-rwxr-xr-x");
}
