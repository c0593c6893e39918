mod common;

use helmsman::core::errors::{ErrorKind, is_error_code};
use helmsman::core::filesystem::Filesystem;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

fn build_fs(root: &Path, quota: u64) -> Filesystem {
    Filesystem::new(
        root,
        quota,
        vec![],
        common::current_user(),
        Duration::from_secs(150),
        Duration::from_secs(300),
    )
    .unwrap()
}

async fn populate(fs: &Filesystem) {
    fs.write_file("start.sh", &b"#!/bin/sh\nexec ./server\n"[..])
        .await
        .unwrap();
    fs.chmod("start.sh", 0o755).await.unwrap();
    fs.write_file("world/level.dat", &b"terrain"[..]).await.unwrap();
    fs.write_file("world/region/r.0.0.mca", &[3u8; 512][..])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_compress_then_decompress_roundtrip() {
    let source_dir = tempfile::tempdir().unwrap();
    let fs = build_fs(source_dir.path(), 0);
    populate(&fs).await;

    let archive = fs
        .compress_files("", &["start.sh".to_string(), "world".to_string()])
        .await
        .unwrap();
    assert!(archive.name.starts_with("archive-"));
    assert!(archive.name.ends_with(".tar.gz"));
    assert!(archive.size > 0);

    // Unpack into a fresh, empty root.
    let dest_dir = tempfile::tempdir().unwrap();
    let dest = build_fs(dest_dir.path(), 0);
    std::fs::copy(
        fs.path().join(&archive.name),
        dest.path().join(&archive.name),
    )
    .unwrap();

    dest.decompress_file("", &archive.name).await.unwrap();

    assert_eq!(
        std::fs::read(dest.path().join("start.sh")).unwrap(),
        b"#!/bin/sh\nexec ./server\n"
    );
    assert_eq!(
        std::fs::read(dest.path().join("world/level.dat")).unwrap(),
        b"terrain"
    );
    assert_eq!(
        std::fs::read(dest.path().join("world/region/r.0.0.mca")).unwrap(),
        vec![3u8; 512]
    );

    // Modes survive the trip.
    let mode = dest
        .path()
        .join("start.sh")
        .metadata()
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o755);
}

#[tokio::test]
async fn test_unknown_archive_format() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0);
    fs.write_file("payload.rar", &b"not really"[..]).await.unwrap();

    let err = fs.decompress_file("", "payload.rar").await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::UnknownArchive));
}

#[tokio::test]
async fn test_escaping_entry_aborts_without_partial_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0);

    // A tar whose second entry climbs out of the root.
    let archive_path = fs.path().join("evil.tar");
    {
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut builder = tar::Builder::new(file);

        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "innocent.txt", &b"fine"[..])
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        let escaping_name = b"../evil.txt";
        header.as_old_mut().name[..escaping_name.len()].copy_from_slice(escaping_name);
        header.set_cksum();
        builder.append(&header, &b"oops"[..]).unwrap();
        builder.finish().unwrap();
    }

    let err = fs.decompress_file("", "evil.tar").await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::PathResolution));

    // Validation runs before extraction: not even the innocent entry
    // may exist, and nothing escaped the root.
    assert!(!fs.path().join("innocent.txt").exists());
    assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
}

#[tokio::test]
async fn test_decompression_respects_quota() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0);
    fs.write_file("big.bin", &[9u8; 4096][..]).await.unwrap();
    let archive = fs
        .compress_files("", &["big.bin".to_string()])
        .await
        .unwrap();
    fs.delete("big.bin").await.unwrap();

    // Shrink the quota below the extracted size; the plan must fail
    // before anything is written.
    fs.set_limit(1024);
    fs.recompute_usage().await;
    let err = fs.decompress_file("", &archive.name).await.unwrap_err();
    assert!(is_error_code(&err, ErrorKind::DiskSpace));
    assert!(!fs.path().join("big.bin").exists());

    // With room to spare the same archive extracts fine.
    fs.set_limit(1024 * 1024);
    fs.decompress_file("", &archive.name).await.unwrap();
    assert!(fs.path().join("big.bin").exists());
}

#[tokio::test]
async fn test_space_available_for_decompression_reports_size() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0);
    fs.write_file("data.bin", &[1u8; 2000][..]).await.unwrap();
    let archive = fs
        .compress_files("", &["data.bin".to_string()])
        .await
        .unwrap();

    let total = fs
        .space_available_for_decompression("", &archive.name)
        .await
        .unwrap();
    assert_eq!(total, 2000);
}

#[tokio::test]
async fn test_zip_extraction_with_modes() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_fs(dir.path(), 0);

    let zip_path = fs.path().join("bundle.zip");
    {
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o700);
        writer.start_file("bin/run", options).unwrap();
        use std::io::Write;
        writer.write_all(b"binary").unwrap();
        writer.finish().unwrap();
    }

    fs.decompress_file("", "bundle.zip").await.unwrap();
    let extracted = fs.path().join("bin/run");
    assert_eq!(std::fs::read(&extracted).unwrap(), b"binary");
    let mode = extracted.metadata().unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o700);
}
