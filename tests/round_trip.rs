//! Store-then-read round trips
//!
//! Headers, payloads and digests must come back exactly as written, and
//! every payload must sit where the header order says it does.

use assetbin_rs::core::writer;
use assetbin_rs::{
    collect_headers, Container, Digest, FileOpener, Header, OpenOptions, RangeOpener, StoreOptions,
};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (path, data) in files {
        let p = root.join(path);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, data).unwrap();
    }
}

#[test]
fn test_three_small_files() {
    let src = TempDir::new().unwrap();
    write_tree(src.path(), &[("a.txt", b"a"), ("b.txt", b"b"), ("sub/d.txt", b"d")]);
    let out = TempDir::new().unwrap();
    let dest = out.path().join("assets.bin");

    let mut headers = collect_headers(src.path()).unwrap();
    writer::store_file(&dest, &mut headers, src.path(), &StoreOptions::default()).unwrap();

    let container = Container::open_file(&dest, &OpenOptions::standalone()).unwrap();
    assert_eq!(container.len(), 3);

    let assets = container.assets_map(container.file_opener().unwrap());
    let keys: Vec<&str> = assets.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["a.txt", "b.txt", "sub/d.txt"]);

    for (key, original) in [("a.txt", b"a"), ("b.txt", b"b"), ("sub/d.txt", b"d")] {
        let asset = &assets[key];
        assert_eq!(asset.size(), 1);
        assert_eq!(asset.digest(), Digest::of(original));
        assert_eq!(asset.data().unwrap(), original);
    }
}

#[test]
fn test_whole_archive_hash_is_concatenation() {
    let src = TempDir::new().unwrap();
    write_tree(src.path(), &[("1", b"first"), ("2", b""), ("3", b"third")]);
    let out = TempDir::new().unwrap();
    let dest = out.path().join("assets.bin");

    let mut headers = collect_headers(src.path()).unwrap();
    let summary =
        writer::store_file(&dest, &mut headers, src.path(), &StoreOptions::default()).unwrap();

    assert_eq!(summary.content_hash, Digest::of(b"firstthird"));
    let container = Container::open_file(&dest, &OpenOptions::standalone()).unwrap();
    assert_eq!(container.content_hash(), summary.content_hash);
    container.verify().unwrap();
}

#[test]
fn test_empty_file_asset() {
    let src = TempDir::new().unwrap();
    write_tree(src.path(), &[("empty", b"")]);
    let out = TempDir::new().unwrap();
    let dest = out.path().join("assets.bin");

    let mut headers = collect_headers(src.path()).unwrap();
    writer::store_file(&dest, &mut headers, src.path(), &StoreOptions::default()).unwrap();

    let container = Container::open_file(&dest, &OpenOptions::standalone()).unwrap();
    let assets = container.assets(container.file_opener().unwrap());
    assert_eq!(assets[0].data().unwrap(), Vec::<u8>::new());
    assert_eq!(assets[0].digest(), Digest::of(b""));
}

#[test]
fn test_logical_paths_independent_of_sources() {
    let src = TempDir::new().unwrap();
    write_tree(src.path(), &[("on-disk-name.css", b"body{}")]);
    let t = Utc.timestamp_opt(1_650_000_000, 42).unwrap();

    let mut headers = vec![Header::new("static/css/site.css", 6, 0o100600, t, t)
        .with_source(src.path().join("on-disk-name.css"))];
    let mut buf = Vec::new();
    writer::store(&mut headers, Path::new("/unused"), t, &mut buf).unwrap();

    let container = Container::read(buf.as_slice()).unwrap();
    assert_eq!(container.headers()[0].path(), "static/css/site.css");
    assert_eq!(container.headers()[0].mod_time(), t);
}

#[test]
fn test_large_random_payloads() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let src = TempDir::new().unwrap();
    let mut originals = Vec::new();
    for i in 0..6 {
        let len = rng.gen_range(0..300_000);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let path = format!("blob{}.bin", i);
        fs::write(src.path().join(&path), &data).unwrap();
        originals.push((path, data));
    }

    let out = TempDir::new().unwrap();
    let dest = out.path().join("big.bin");
    let mut headers = collect_headers(src.path()).unwrap();
    writer::store_file(&dest, &mut headers, src.path(), &StoreOptions::default()).unwrap();

    let container = Container::open_file(&dest, &OpenOptions::standalone()).unwrap();
    let assets = container.assets_map(container.file_opener().unwrap());
    for (path, data) in &originals {
        assert_eq!(&assets[path].data().unwrap(), data);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_headers_and_payloads_round_trip(
        files in prop::collection::btree_map(
            "[a-z]{1,8}(/[a-z]{1,8}){0,2}",
            (
                prop::collection::vec(any::<u8>(), 0..512),
                0u32..0o7777,
                -4_000_000_000_000_000_000i64..4_000_000_000_000_000_000i64,
            ),
            1..8,
        )
    ) {
        let src = TempDir::new().unwrap();
        let mut headers = Vec::new();
        for (i, (path, (data, mode, nanos))) in files.iter().enumerate() {
            let disk = src.path().join(format!("src{}", i));
            fs::write(&disk, data).unwrap();
            let t = Utc.timestamp_nanos(*nanos);
            let header = Header::new(path.as_str(), data.len() as u64, *mode, t, t);
            headers.push(header.with_source(disk));
        }

        let mut buf = Vec::new();
        let build = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        writer::store(&mut headers, src.path(), build, &mut buf).unwrap();

        let container = Container::read(buf.as_slice()).unwrap();
        prop_assert_eq!(container.headers(), &headers[..]);
        prop_assert_eq!(container.build_time(), build);

        for (header, offset) in container.segments() {
            let start = offset as usize;
            let payload = &buf[start..start + header.size() as usize];
            prop_assert_eq!(Some(Digest::of(payload)), header.digest());
        }
    }

    #[test]
    fn prop_payload_offsets_follow_header_order(
        sizes in prop::collection::vec(0usize..2048, 1..12)
    ) {
        let src = TempDir::new().unwrap();
        for (i, size) in sizes.iter().enumerate() {
            fs::write(src.path().join(format!("f{:02}", i)), vec![i as u8; *size]).unwrap();
        }
        let out = TempDir::new().unwrap();
        let dest = out.path().join("c.bin");
        let mut headers = collect_headers(src.path()).unwrap();
        writer::store_file(&dest, &mut headers, src.path(), &StoreOptions::default()).unwrap();

        let container = Container::open_file(&dest, &OpenOptions::standalone()).unwrap();
        let opener: Arc<dyn RangeOpener> = Arc::new(FileOpener::new(&dest));

        let mut expected = container.headers_size();
        for (i, (header, offset)) in container.segments().enumerate() {
            prop_assert_eq!(offset, expected);
            prop_assert_eq!(header.size() as usize, sizes[i]);

            let mut data = Vec::new();
            opener.open_range(offset, header.size()).unwrap().read_to_end(&mut data).unwrap();
            prop_assert!(data.iter().all(|&b| b == i as u8));
            expected += header.size();
        }
        prop_assert_eq!(expected, fs::metadata(&dest).unwrap().len());
    }
}
