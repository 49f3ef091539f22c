//! Size accounting through the encryption layer

use std::sync::Arc;

use stowage_storage::{
    create_encryptor, EncryptedStorage, ListOptions, Source, Storage, StreamEncryptor,
    ENCRYPTED_SUFFIX,
};
use tokio::io::AsyncReadExt;

use crate::harness::{memory_backend, plain_cas, pull_all, sample};

const SIZES: [usize; 6] = [0, 1, 15, 16, 128 * 1024, 128 * 1024 + 17];

fn encryptor() -> Arc<dyn StreamEncryptor> {
    create_encryptor("aes256cfb", b"accounting").unwrap()
}

#[tokio::test]
async fn test_plaintext_sizes_in_list_and_stat() {
    let (raw, backend) = memory_backend();
    let enc = encryptor();
    let overhead = enc.overhead();
    let stack = EncryptedStorage::wrap(enc, backend).unwrap();

    let mut total = 0u64;
    for (i, size) in SIZES.iter().enumerate() {
        let path = format!("dir/obj{i}");
        stack
            .push(Source::from_bytes(sample(*size, i as u64)), &path)
            .await
            .unwrap();
        total += *size as u64;

        let stored = raw
            .backend()
            .object(&format!("{path}{ENCRYPTED_SUFFIX}"))
            .unwrap();
        assert_eq!(stored.len() as u64, *size as u64 + overhead);

        let listed = stack.list(&path, &ListOptions::default()).await.unwrap();
        assert_eq!(listed[0].size(), *size as u64);
        assert_eq!(stack.stat(&path).await.unwrap().total_size, *size as u64);
        assert_eq!(pull_all(stack.as_ref(), &path).await.unwrap().len(), *size);
    }

    let stat = stack.stat("dir/").await.unwrap();
    assert_eq!(stat.total_size, total);
    assert_eq!(stat.files, SIZES.len() as u64);
}

#[tokio::test]
async fn test_listing_hides_cipher_suffix() {
    let (_, backend) = memory_backend();
    let stack = EncryptedStorage::wrap(encryptor(), backend).unwrap();
    stack.push(Source::from_bytes(&b"abc"[..]), "x/name").await.unwrap();
    let listed = stack.list("x/", &ListOptions::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name(), "name");
    assert_eq!(listed[0].path(), "x/name");
}

#[tokio::test]
async fn test_cas_sizes_match_pull() {
    let (_, backend) = memory_backend();
    let cas = plain_cas(backend).await;
    for (i, size) in SIZES.iter().enumerate() {
        let path = format!("c/{i}");
        cas.push(Source::from_bytes(sample(*size, 100 + i as u64)), &path)
            .await
            .unwrap();
        let listed = cas.list(&path, &ListOptions::default()).await.unwrap();
        assert_eq!(listed[0].size(), *size as u64);
        assert_eq!(pull_all(&cas, &path).await.unwrap().len(), *size);
    }
}

#[tokio::test]
async fn test_cas_ranged_reads() {
    let (_, backend) = memory_backend();
    let cas = plain_cas(backend).await;
    let payload = sample(100_000, 9);
    cas.push(Source::from_bytes(payload.clone()), "r").await.unwrap();
    for (offset, len) in [(0u64, 10u64), (4_095, 2), (50_000, 30_000), (99_990, 100)] {
        let mut out = Vec::new();
        cas.open("r", offset, Some(len))
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        let start = offset as usize;
        let end = (start + len as usize).min(payload.len());
        assert_eq!(out, payload[start..end]);
    }
    let mut tail = Vec::new();
    cas.open("r", 100_000, None)
        .await
        .unwrap()
        .read_to_end(&mut tail)
        .await
        .unwrap();
    assert!(tail.is_empty());
}
