#[path = "../src/backup.rs"]
mod backup;

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("cbcrank-backup-src");
    let workspace2 = temp_dir("cbcrank-backup-dst");
    let out_dir = temp_dir("cbcrank-backup-out");

    let db_src = workspace.join("cbcrank.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.cbcbackup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 2);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT_V1);
    assert_eq!(manifest["version"], 1);
    let expected_sha: String = Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    assert_eq!(manifest["dbSha256"].as_str(), Some(expected_sha.as_str()));
    assert_eq!(export.db_sha256, expected_sha);
    assert!(manifest["exportedAt"].as_str().is_some());
    archive
        .by_name("db/cbcrank.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);

    let db_dst = workspace2.join("cbcrank.sqlite3");
    let restored = std::fs::read(&db_dst).expect("read restored db");
    assert_eq!(restored, bytes);
    assert!(!workspace2.join("cbcrank.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let out_dir = temp_dir("cbcrank-backup-raw");
    let workspace = temp_dir("cbcrank-backup-raw-dst");

    let raw_file = out_dir.join("copy.sqlite3");
    let bytes = b"raw-sqlite-copy";
    std::fs::write(&raw_file, bytes).expect("write raw sqlite file");

    let import = backup::import_workspace_bundle(&raw_file, &workspace).expect("import raw sqlite");
    assert_eq!(import.bundle_format_detected, backup::RAW_SQLITE_FORMAT);

    let restored = std::fs::read(workspace.join("cbcrank.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_database_entry_is_rejected() {
    let out_dir = temp_dir("cbcrank-backup-tamper");
    let workspace = temp_dir("cbcrank-backup-tamper-dst");
    std::fs::write(workspace.join("cbcrank.sqlite3"), b"original").expect("write existing db");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(
            serde_json::json!({
                "format": backup::BUNDLE_FORMAT_V1,
                "version": 1,
                "dbSha256": "00"
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/cbcrank.sqlite3", opts).expect("db entry");
        zip.write_all(b"not what the manifest says").expect("write db");
        zip.finish().expect("finish zip");
    }

    let res = backup::import_workspace_bundle(&bundle_path, &workspace);
    let msg = format!("{:#}", res.expect_err("checksum mismatch"));
    assert!(msg.contains("checksum"), "{}", msg);

    // The existing database is left untouched.
    let kept = std::fs::read(workspace.join("cbcrank.sqlite3")).expect("read existing db");
    assert_eq!(kept, b"original");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_bundle_format_is_rejected() {
    let out_dir = temp_dir("cbcrank-backup-format");
    let workspace = temp_dir("cbcrank-backup-format-dst");

    let bundle_path = out_dir.join("other.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        zip.start_file("manifest.json", zip::write::FileOptions::default())
            .expect("manifest entry");
        zip.write_all(br#"{"format":"somebody-else-v9"}"#)
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let res = backup::import_workspace_bundle(&bundle_path, &workspace);
    assert!(res.is_err());
    assert!(!workspace.join("cbcrank.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
