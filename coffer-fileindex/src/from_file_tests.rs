use std::io::Write;

use hex_literal::hex;
use tempfile::NamedTempFile;

use super::*;

pub fn temp_file(pattern: u8, count: usize) -> NamedTempFile {
    let mut tempf = NamedTempFile::new().expect("temp file");
    let contents = vec![pattern; count];
    tempf.write_all(contents.as_slice()).expect("write temp file");
    tempf
}

const MIB: usize = 1048576;

#[tokio::test]
async fn single_file_index() {
    let tempf = temp_file(b'.', 1049600);

    let indexer = Indexer::from_file(tempf.path(), MIB)
        .await
        .expect("Indexer::from_file");
    let index = indexer.index().await.expect("index");

    assert_eq!(
        index.root().to_owned(),
        tempf.path().parent().unwrap().canonicalize().unwrap()
    );
    assert_eq!(
        index.path().to_owned(),
        tempf.path().file_name().unwrap().to_owned()
    );
    assert_eq!(index.length(), 1049600);
    assert_eq!(
        index.digest(),
        hex!("529df3a7e7acab0e3b53e7cd930faa22e62cd07a948005b1c3f7f481f32a7297")
    );
    assert_eq!(index.chunk_digests().len(), 2);
    assert_eq!(
        index.chunk_digests()[0],
        hex!("153faf1f2a007097d33120bbee6944a41cb8be7643c1222f6bc6bc69ec31688f")
    );
    assert_eq!(
        index.chunk_digests()[1],
        hex!("ca33403cfcb21bae20f21507475a3525c7f4bd36bb2a7074891e3307c5fd47d5")
    );

    let done = Progress {
        position: 1049600,
        length: 1049600,
    };
    assert_eq!(*indexer.subscribe_index_progress().borrow(), done);
    assert_eq!(*indexer.subscribe_digest_progress().borrow(), done);
}

#[tokio::test]
async fn empty_file_index() {
    let tempf = temp_file(b'.', 0);

    let indexer = Indexer::from_file(tempf.path(), MIB)
        .await
        .expect("Indexer::from_file");
    let index = indexer.index().await.expect("index");

    assert_eq!(index.length(), 0);
    assert!(index.chunk_digests().is_empty());
    assert_eq!(
        index.digest(),
        hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
    );
}

#[tokio::test]
async fn verify_and_read_chunks() {
    let tempf = temp_file(b'.', 1049600);
    let index = Indexer::from_file(tempf.path(), MIB)
        .await
        .expect("Indexer::from_file")
        .index()
        .await
        .expect("index");

    let tail = read_chunk(&index.full_path(), MIB, 1)
        .await
        .expect("read chunk");
    assert_eq!(tail.len(), 1024);
    assert!(index.verify_chunk(1, &tail));
    assert!(!index.verify_chunk(0, &tail));
    assert!(!index.verify_chunk(2, &tail));

    let past_end = read_chunk(&index.full_path(), MIB, 5)
        .await
        .expect("read chunk");
    assert!(past_end.is_empty());
}

#[tokio::test]
async fn zero_chunk_size_rejected() {
    let tempf = temp_file(b'.', 16);
    assert!(Indexer::from_file(tempf.path(), 0).await.is_err());
}
