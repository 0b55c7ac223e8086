//! Firmware download tests: streaming digest and framing variants.

use cloudlink::ota::{OtaDownloader, OtaError, OtaOutcome};
use cloudlink::testing::mocks::MemorySink;
use md5::{Digest, Md5};

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Deterministic pseudo-firmware of `len` bytes.
fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn fixed_response(image: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
        image.len()
    )
    .into_bytes();
    raw.extend_from_slice(image);
    raw
}

fn chunked_response(image: &[u8], sizes: &[usize]) -> Vec<u8> {
    let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    let mut rest = image;
    let mut i = 0;
    while !rest.is_empty() {
        let n = sizes[i % sizes.len()].clamp(1, rest.len());
        raw.extend_from_slice(format!("{n:x}\r\n").as_bytes());
        raw.extend_from_slice(&rest[..n]);
        raw.extend_from_slice(b"\r\n");
        rest = &rest[n..];
        i += 1;
    }
    raw.extend_from_slice(b"0\r\n\r\n");
    raw
}

#[tokio::test]
async fn streaming_digest_matches_single_pass_over_chunked_body() {
    let image = test_image(64 * 1024);
    let md5 = hex(&Md5::digest(&image));
    let raw = chunked_response(&image, &[1, 7, 1024, 4096, 13]);

    let mut sink = MemorySink::default();
    let outcome = OtaDownloader::default()
        .download_from(&raw[..], &md5, &mut sink)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        OtaOutcome::Updated {
            bytes: image.len() as u64,
            md5_hex: md5.clone()
        }
    );
    assert_eq!(sink.written(), &image[..]);
    assert_eq!(sink.committed(), Some((image.len() as u64, md5)));
}

#[tokio::test]
async fn large_fixed_body_is_streamed_and_committed() {
    let image = test_image(256 * 1024);
    let md5 = hex(&Md5::digest(&image));
    let raw = fixed_response(&image);

    let mut sink = MemorySink::default();
    let outcome = OtaDownloader::default()
        .download_from(&raw[..], &md5, &mut sink)
        .await
        .unwrap();

    assert!(matches!(outcome, OtaOutcome::Updated { bytes, .. } if bytes == image.len() as u64));
    assert_eq!(sink.written(), &image[..]);
}

#[tokio::test]
async fn expected_md5_comparison_is_case_insensitive() {
    let image = test_image(1024);
    let md5_upper = hex(&Md5::digest(&image)).to_uppercase();
    let raw = fixed_response(&image);

    let mut sink = MemorySink::default();
    let outcome = OtaDownloader::default()
        .download_from(&raw[..], &md5_upper, &mut sink)
        .await
        .unwrap();
    assert!(matches!(outcome, OtaOutcome::Updated { .. }));
}

#[tokio::test]
async fn corrupted_chunked_image_is_aborted() {
    let image = test_image(8 * 1024);
    let md5 = hex(&Md5::digest(&image));
    let mut corrupted = image.clone();
    corrupted[4000] ^= 0xFF;
    let raw = chunked_response(&corrupted, &[512]);

    let mut sink = MemorySink::default();
    let result = OtaDownloader::default()
        .download_from(&raw[..], &md5, &mut sink)
        .await;

    assert!(matches!(result, Err(OtaError::ChecksumMismatch { .. })));
    assert!(sink.aborted());
    assert_eq!(sink.committed(), None);
}

#[tokio::test]
async fn truncated_chunked_body_is_aborted() {
    let image = test_image(8 * 1024);
    let md5 = hex(&Md5::digest(&image));
    let mut raw = chunked_response(&image, &[1024]);
    // Drop the terminator chunk and part of the last data chunk
    raw.truncate(raw.len() - 600);

    let mut sink = MemorySink::default();
    let result = OtaDownloader::default()
        .download_from(&raw[..], &md5, &mut sink)
        .await;

    assert!(matches!(result, Err(OtaError::Http(_))));
    assert!(sink.aborted());
    assert_eq!(sink.committed(), None);
}
