mod common;

use std::path::Path;
use std::time::Duration;

use kira_sync::download::{FileDownloader, is_complete, marker_path, partial_marker_path};
use kira_sync::progress::NoProgress;
use kira_sync::storage::StoragePointer;

use common::RangeServer;

const CONTENT: &[u8] = b"REMOTE-CONTENT";

fn s3_pointer(server: &RangeServer) -> StoragePointer {
    StoragePointer::S3 {
        uri: "s3://bucket/reads.fastq".to_string(),
        endpoint_url: None,
        presigned_url: Some(server.url.clone()),
    }
}

fn downloader() -> FileDownloader {
    FileDownloader::new(Duration::from_secs(5)).unwrap()
}

fn interrupted(target: &Path, prefix: &[u8]) {
    std::fs::write(target, prefix).unwrap();
    std::fs::write(partial_marker_path(target), b"").unwrap();
}

#[test]
fn head_requests_a_leading_range() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");

    downloader()
        .download(&s3_pointer(&server), &target, Some(5), true, &NoProgress)
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"REMOT");
    assert_eq!(server.ranges(), vec![Some("bytes=0-4".to_string())]);
    assert!(!marker_path(&target).exists());
    assert!(!partial_marker_path(&target).exists());
}

#[test]
fn stale_file_is_replaced_when_cache_is_off() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");
    std::fs::write(&target, b"old").unwrap();

    downloader()
        .download(&s3_pointer(&server), &target, None, false, &NoProgress)
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
    assert_eq!(server.ranges(), vec![None]);
    assert!(is_complete(&target));
}

#[test]
fn unmarked_file_is_replaced_even_with_cache() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");
    std::fs::write(&target, b"old").unwrap();

    downloader()
        .download(&s3_pointer(&server), &target, None, true, &NoProgress)
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
    assert_eq!(server.ranges(), vec![None]);
}

#[test]
fn interrupted_download_appends_the_missing_tail() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");
    interrupted(&target, b"REMOTE");

    downloader()
        .download(&s3_pointer(&server), &target, None, true, &NoProgress)
        .unwrap();

    assert_eq!(server.ranges(), vec![Some("bytes=6-".to_string())]);
    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
    assert!(is_complete(&target));
    assert!(!partial_marker_path(&target).exists());
}

#[test]
fn unsatisfiable_range_means_already_complete() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");
    interrupted(&target, CONTENT);

    downloader()
        .download(&s3_pointer(&server), &target, None, true, &NoProgress)
        .unwrap();

    assert_eq!(server.ranges(), vec![Some(format!("bytes={}-", CONTENT.len()))]);
    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
    assert!(is_complete(&target));
}

#[test]
fn ignored_range_restarts_from_zero() {
    let server = RangeServer::start(CONTENT, false);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");
    interrupted(&target, b"REMOTE");

    downloader()
        .download(&s3_pointer(&server), &target, None, true, &NoProgress)
        .unwrap();

    assert_eq!(server.ranges(), vec![Some("bytes=6-".to_string())]);
    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
    assert!(is_complete(&target));
}

#[test]
fn generic_backend_never_sends_ranges() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("SRR1");
    interrupted(&target, b"REMOTE");
    let pointer = StoragePointer::Sra {
        url: server.url.clone(),
    };

    downloader()
        .download(&pointer, &target, None, true, &NoProgress)
        .unwrap();

    assert_eq!(server.ranges(), vec![None]);
    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
}

#[test]
fn completed_target_is_not_requested_again() {
    let server = RangeServer::start(CONTENT, true);
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("reads.fastq");
    let downloader = downloader();

    downloader
        .download(&s3_pointer(&server), &target, None, true, &NoProgress)
        .unwrap();
    downloader
        .download(&s3_pointer(&server), &target, None, true, &NoProgress)
        .unwrap();

    assert_eq!(server.ranges().len(), 1);
    assert_eq!(std::fs::read(&target).unwrap(), CONTENT);
}
