// Integration tests for the filesystem storage backend

use anyhow::Result;
use filing_pipeline::io::cloud::{ErrorKind, LocalObjectIO, ObjectIO};
use filing_pipeline::testing::*;
use filing_pipeline::{ShardLocator, ShardWriter};
use std::io::Read;
use tempfile::tempdir;

const BUCKET: &str = "filings";

#[test]
fn objects_round_trip_through_the_filesystem() -> Result<()> {
    let dir = tempdir()?;
    let storage = LocalObjectIO::new(dir.path());

    storage.put_object(BUCKET, "upload/2024/TESTLEI0001/1.csv", b"uid\nA\n")?;

    assert!(dir.path().join("filings/upload/2024/TESTLEI0001/1.csv").is_file());
    assert_eq!(storage.get_object(BUCKET, "upload/2024/TESTLEI0001/1.csv")?, b"uid\nA\n");
    let mut streamed = String::new();
    storage
        .open_object(BUCKET, "upload/2024/TESTLEI0001/1.csv")?
        .read_to_string(&mut streamed)?;
    assert_eq!(streamed, "uid\nA\n");
    assert!(storage.object_exists(BUCKET, "upload/2024/TESTLEI0001/1.csv")?);

    storage.delete_object(BUCKET, "upload/2024/TESTLEI0001/1.csv")?;
    storage.delete_object(BUCKET, "upload/2024/TESTLEI0001/1.csv")?;
    assert!(!storage.object_exists(BUCKET, "upload/2024/TESTLEI0001/1.csv")?);
    Ok(())
}

#[test]
fn missing_objects_report_not_found() -> Result<()> {
    let dir = tempdir()?;
    let storage = LocalObjectIO::new(dir.path());

    let err = storage.get_object(BUCKET, "nothing/here.csv").expect_err("absent");

    assert!(err.is_not_found());
    assert!(storage.list_objects("no-such-bucket", Some("upload/"))?.is_empty());
    Ok(())
}

#[test]
fn keys_cannot_escape_their_bucket() -> Result<()> {
    let dir = tempdir()?;
    let storage = LocalObjectIO::new(dir.path().join("root"));

    let err = storage.put_object(BUCKET, "../outside.csv", b"x").expect_err("escape");

    assert_eq!(err.kind, ErrorKind::InvalidInput);
    assert!(!dir.path().join("root/outside.csv").exists());
    Ok(())
}

#[test]
fn listing_filters_by_prefix_in_key_order() -> Result<()> {
    let dir = tempdir()?;
    let storage = LocalObjectIO::new(dir.path());
    for key in ["a/2.txt", "a/1.txt", "a/b/3.txt", "ab/4.txt"] {
        storage.put_object(BUCKET, key, b"x")?;
    }

    let keys: Vec<String> = storage
        .list_objects(BUCKET, Some("a/"))?
        .into_iter()
        .map(|o| o.key)
        .collect();

    assert_eq!(keys, vec!["a/1.txt", "a/2.txt", "a/b/3.txt"]);
    Ok(())
}

#[test]
fn shard_sets_are_located_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let storage = LocalObjectIO::new(dir.path());
    let key = upload_key(&sample_submission_key());
    put_csv(&storage, BUCKET, &key, &sample_csv(11))?;

    let output = ShardWriter::new(&storage, 5).convert(BUCKET, &key)?;
    let shards = ShardLocator::new(&storage).list(BUCKET, &output.shard_dir)?;

    assert_eq!(
        shards,
        vec![
            "upload/2024/TESTLEI0001/1_pqs/00001.parquet",
            "upload/2024/TESTLEI0001/1_pqs/00002.parquet",
            "upload/2024/TESTLEI0001/1_pqs/00003.parquet",
        ]
    );
    assert_eq!(read_table(&storage, BUCKET, &output.shard_dir)?.num_rows(), 11);
    assert!(ShardLocator::new(&storage).list(BUCKET, "upload/2024/TESTLEI0001/1_res/")?.is_empty());
    Ok(())
}
