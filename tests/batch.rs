mod common;

use assert_matches::assert_matches;
use reqwest::Method;
use serde_json::{Value, json};

use kira_sync::batch::{BatchRunner, TransferRequest, TransferStatus};
use kira_sync::download::{FileDownloader, is_complete};
use kira_sync::error::KiraError;
use kira_sync::progress::NoProgress;
use kira_sync::resources::{DownloadOptions, ResultFile};
use kira_sync::session::Session;
use kira_sync::upload::TransferConfig;

use common::{
    BytesBackend, MockTransport, RecordingParts, file_blob, script_sample_chain, signed_urls,
    uncached_session,
};

const FOLDER_URL: &str = "nested/lab/sample_groups/soil/samples/s1/analysis_results/kraken";

fn script_batch(transport: &MockTransport) {
    script_sample_chain(transport);
    transport.respond(
        Method::GET,
        &format!("{FOLDER_URL}/fields/reads"),
        file_blob("file-1", "reads", json!({})),
    );
    transport.respond(
        Method::GET,
        &format!("{FOLDER_URL}/fields/contigs"),
        file_blob(
            "file-2",
            "contigs",
            json!({
                "__type__": "s3",
                "uri": "s3://bucket/contigs.fa",
                "presigned_url": "https://signed.test/contigs.fa"
            }),
        ),
    );
    transport.respond(
        Method::GET,
        &format!("{FOLDER_URL}/fields/stats"),
        file_blob("file-3", "stats", json!({"reads": 10})),
    );
    transport.respond(
        Method::POST,
        "ar_fields/file-1/create_upload",
        json!({"upload_id": "up-1"}),
    );
    transport.respond(
        Method::POST,
        "ar_fields/file-1/create_upload_urls",
        signed_urls(1),
    );
    transport.respond(Method::POST, "ar_fields/file-1/complete_upload", Value::Null);
}

fn file(session: &Session, name: &str) -> ResultFile {
    session
        .organization("lab")
        .project("soil")
        .sample("s1")
        .result_folder("kraken")
        .result_file(name)
}

#[test]
fn outcomes_follow_submission_order_and_failures_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("reads.fastq");
    std::fs::write(&source, b"ACGTACGT").unwrap();
    let contigs_target = dir.path().join("contigs.fa");

    let transport = MockTransport::new();
    script_batch(&transport);
    let session = uncached_session(&transport);
    let parts = RecordingParts::default();
    let backend = BytesBackend::new(b">c1\nACGT\n".to_vec());
    let downloader = FileDownloader::with_backends(backend.clone(), backend.clone(), backend.clone());
    let runner = BatchRunner::new(3, TransferConfig::default(), &parts, &downloader, &NoProgress);

    let requests = vec![
        TransferRequest::Download {
            file: file(&session, "stats"),
            options: DownloadOptions::default(),
        },
        TransferRequest::Upload {
            file: file(&session, "reads"),
            source: source.clone(),
        },
        TransferRequest::Download {
            file: file(&session, "contigs"),
            options: DownloadOptions {
                target: Some(contigs_target.clone()),
                ..DownloadOptions::default()
            },
        },
    ];
    let outcomes = runner.run(requests).unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_matches!(outcomes[0].result, Err(KiraError::UnsupportedStorage));
    assert!(!outcomes[0].is_success());

    assert_eq!(outcomes[1].label, source.display().to_string());
    assert_matches!(&outcomes[1].result, Ok(TransferStatus::Uploaded(receipt)) if receipt.upload_id == "up-1");
    assert_eq!(parts.reassembled(), b"ACGTACGT");

    assert_matches!(&outcomes[2].result, Ok(TransferStatus::Downloaded(path)) if *path == contigs_target);
    assert!(is_complete(&contigs_target));
    assert_eq!(backend.requests()[0].0, "https://signed.test/contigs.fa");
}

#[test]
fn cancelled_batch_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("reads.fastq");
    std::fs::write(&source, b"ACGT").unwrap();

    let transport = MockTransport::new();
    script_batch(&transport);
    let session = uncached_session(&transport);
    let parts = RecordingParts::default();
    let backend = BytesBackend::new(b"data".to_vec());
    let downloader = FileDownloader::with_backends(backend.clone(), backend.clone(), backend.clone());
    let runner = BatchRunner::new(2, TransferConfig::default(), &parts, &downloader, &NoProgress);

    runner.cancel_handle().cancel();
    let outcomes = runner
        .run(vec![
            TransferRequest::Upload {
                file: file(&session, "reads"),
                source,
            },
            TransferRequest::Download {
                file: file(&session, "contigs"),
                options: DownloadOptions::default(),
            },
        ])
        .unwrap();

    assert!(
        outcomes
            .iter()
            .all(|outcome| matches!(outcome.result, Ok(TransferStatus::Skipped)))
    );
    assert!(parts.received().is_empty());
    assert!(backend.requests().is_empty());
    assert!(transport.calls().is_empty());
}

#[test]
fn single_worker_runs_sequentially() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    script_batch(&transport);
    let session = uncached_session(&transport);
    let parts = RecordingParts::default();
    let backend = BytesBackend::new(b"data".to_vec());
    let downloader = FileDownloader::with_backends(backend.clone(), backend.clone(), backend.clone());
    let runner = BatchRunner::new(0, TransferConfig::default(), &parts, &downloader, &NoProgress);

    let requests = (0..4)
        .map(|n| TransferRequest::Download {
            file: file(&session, "contigs"),
            options: DownloadOptions {
                target: Some(dir.path().join(format!("copy-{n}.fa"))),
                ..DownloadOptions::default()
            },
        })
        .collect();
    let outcomes = runner.run(requests).unwrap();

    assert!(outcomes.iter().all(|outcome| outcome.is_success()));
    for (n, outcome) in outcomes.iter().enumerate() {
        let expected = dir.path().join(format!("copy-{n}.fa"));
        assert_matches!(&outcome.result, Ok(TransferStatus::Downloaded(path)) if *path == expected);
    }
    assert_eq!(backend.requests().len(), 4);
}
