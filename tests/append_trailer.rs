//! Containers appended to other files
//!
//! The trailer must locate the container regardless of what precedes it.

use assetbin_rs::core::container::gz_sibling;
use assetbin_rs::core::writer;
use assetbin_rs::{collect_headers, AssetBundle, Container, Header, OpenOptions, StoreOptions};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

fn source_dir() -> TempDir {
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("img")).unwrap();
    fs::write(src.path().join("index.html"), b"<html></html>").unwrap();
    fs::write(src.path().join("img/logo.svg"), b"<svg/>").unwrap();
    src
}

fn headers(src: &Path) -> Vec<Header> {
    collect_headers(src).unwrap()
}

#[test]
fn test_append_after_unrelated_prefix() {
    let src = source_dir();
    let out = TempDir::new().unwrap();
    let host = out.path().join("server");

    let mut prefix = vec![0u8; 1024];
    rand::thread_rng().fill_bytes(&mut prefix);
    fs::write(&host, &prefix).unwrap();

    let mut hs = headers(src.path());
    let summary = writer::store_file(&host, &mut hs, src.path(), &StoreOptions::append()).unwrap();
    assert_eq!(summary.offset, 1024);

    let container = Container::open_file(&host, &OpenOptions::ended()).unwrap();
    assert_eq!(container.base_offset(), 1024);
    assert_eq!(container.len(), 2);
    container.verify().unwrap();

    let assets = container.assets_map(container.file_opener().unwrap());
    assert_eq!(assets["index.html"].data().unwrap(), b"<html></html>");
    assert_eq!(assets["img/logo.svg"].data().unwrap(), b"<svg/>");

    // The prefix is untouched
    assert_eq!(&fs::read(&host).unwrap()[..1024], &prefix[..]);
}

#[test]
fn test_append_onto_missing_file() {
    let src = source_dir();
    let out = TempDir::new().unwrap();
    let host = out.path().join("fresh");

    let mut hs = headers(src.path());
    writer::store_file(&host, &mut hs, src.path(), &StoreOptions::append()).unwrap();

    let container = Container::open_file(&host, &OpenOptions::ended()).unwrap();
    assert_eq!(container.base_offset(), 0);
}

#[test]
fn test_two_appends_read_from_either_end() {
    let src = source_dir();
    let out = TempDir::new().unwrap();
    let host = out.path().join("host");
    fs::write(&host, b"PREFIX").unwrap();

    let mut first = headers(src.path());
    let s1 = writer::store_file(&host, &mut first, src.path(), &StoreOptions::append()).unwrap();
    let first_end = fs::metadata(&host).unwrap().len();

    fs::write(src.path().join("index.html"), b"<html>v2</html>").unwrap();
    let mut second = headers(src.path());
    let s2 = writer::store_file(&host, &mut second, src.path(), &StoreOptions::append()).unwrap();

    let latest = Container::open_file(&host, &OpenOptions::ended()).unwrap();
    assert_eq!(latest.content_hash(), s2.content_hash);

    let older = Container::open_file(&host, &OpenOptions::ended().end_position(first_end)).unwrap();
    assert_eq!(older.content_hash(), s1.content_hash);
    assert_eq!(older.base_offset(), 6);
    older.verify().unwrap();
}

#[test]
fn test_gzip_append_is_multi_member() {
    let src = source_dir();
    let out = TempDir::new().unwrap();
    let host = out.path().join("bundle");

    // An earlier gzip member holding unrelated bytes
    {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let gz = fs::File::create(gz_sibling(&host)).unwrap();
        let mut enc = GzEncoder::new(gz, Compression::fast());
        enc.write_all(b"earlier member").unwrap();
        enc.finish().unwrap();
    }

    let mut hs = headers(src.path());
    let options = StoreOptions::append().gzip(true);
    let summary = writer::store_file(&host, &mut hs, src.path(), &options).unwrap();
    assert_eq!(summary.offset, 14);

    let bundle = AssetBundle::open_appended(&host).unwrap();
    assert_eq!(bundle.read("img/logo.svg").unwrap(), b"<svg/>");
    assert!(!gz_sibling(&host).exists());
    assert!(fs::read(&host).unwrap().starts_with(b"earlier member"));
}

#[test]
fn test_standalone_read_of_appended_file_fails() {
    let src = source_dir();
    let out = TempDir::new().unwrap();
    let host = out.path().join("host");
    fs::write(&host, b"not a container header at all, just some bytes").unwrap();

    let mut hs = headers(src.path());
    writer::store_file(&host, &mut hs, src.path(), &StoreOptions::append()).unwrap();
    assert!(Container::open_file(&host, &OpenOptions::standalone()).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_trailer_locates_container_after_any_prefix(
        prefix in prop::collection::vec(any::<u8>(), 0..4096),
        payload in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("data.bin"), &payload).unwrap();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut hs = headers(src.path());
        let mut container_bytes = Vec::new();
        writer::append(&mut hs, src.path(), t, &mut container_bytes).unwrap();

        let mut combined = prefix.clone();
        combined.extend_from_slice(&container_bytes);

        let n = combined.len();
        let trailer = u32::from_be_bytes(combined[n - 4..].try_into().unwrap()) as usize;
        prop_assert_eq!(n - 4 - trailer, prefix.len());

        let out = TempDir::new().unwrap();
        let path = out.path().join("combined");
        fs::write(&path, &combined).unwrap();
        let container = Container::open_file(&path, &OpenOptions::ended()).unwrap();
        prop_assert_eq!(container.base_offset() as usize, prefix.len());

        let assets = container.assets_map(container.file_opener().unwrap());
        prop_assert_eq!(assets["data.bin"].data().unwrap(), payload);
    }
}
