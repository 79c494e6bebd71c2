//! Directory tree shape, lazy registry loading and concurrent reads

use assetbin_rs::core::writer;
use assetbin_rs::{
    Asset, AssetBundle, AssetError, AssetMap, Container, Dir, Header, LoaderConfig, Node,
    OpenOptions, ReaderPool, Registry, StoreOptions, Walk,
};
use chrono::{TimeZone, Utc};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn memory_asset(path: &str, data: &[u8]) -> Asset {
    let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    Asset::from_bytes(Header::new(path, data.len() as u64, 0o100644, t, t), data.to_vec())
}

fn map_of(paths: &[&str]) -> AssetMap {
    paths
        .iter()
        .map(|p| (p.to_string(), memory_asset(p, p.as_bytes())))
        .collect()
}

fn names(dir: &Dir) -> Vec<&str> {
    dir.list().iter().map(Node::name).collect()
}

#[test]
fn test_sibling_order_and_positions() {
    let root = Dir::build(&map_of(&["x/y.txt", "x/z.txt", "w.txt"])).unwrap();
    assert_eq!(names(&root), vec!["w.txt", "x"]);

    let w = root.child("w.txt").unwrap();
    assert!(!w.is_dir());
    assert_eq!(w.position().index, 0);
    assert!(w.position().first);
    assert!(!w.position().last);

    let x = root.get_dir("x").unwrap();
    assert_eq!(names(x), vec!["y.txt", "z.txt"]);
    assert_eq!(x.position().index, 1);
    assert!(x.position().last);
    assert_eq!(x.position().depth, 1);

    let z = x.child("z.txt").unwrap();
    assert_eq!(z.path(), "x/z.txt");
    assert_eq!(z.position().depth, 2);
    assert!(z.position().last && !z.position().first);
}

#[test]
fn test_build_is_deterministic() {
    let map = map_of(&["b/2", "a", "b/1", "c/d/e"]);
    let first = Dir::build(&map).unwrap();
    let second = Dir::build(&map).unwrap();
    assert_eq!(first.to_string(), second.to_string());

    let mut order = Vec::new();
    first
        .walk(|node| {
            order.push(node.path().to_string());
            Ok(Walk::Continue)
        })
        .unwrap();
    assert_eq!(order, vec!["a", "b", "b/1", "b/2", "c", "c/d", "c/d/e"]);
}

#[test]
fn test_walk_skip_dir() {
    let root = Dir::build(&map_of(&["a/1", "a/2", "b"])).unwrap();
    let mut seen = Vec::new();
    root.walk(|node| {
        seen.push(node.path().to_string());
        Ok(if node.is_dir() { Walk::SkipDir } else { Walk::Continue })
    })
    .unwrap();
    assert_eq!(seen, vec!["a", "b"]);
}

#[test]
fn test_walk_stops_on_visitor_error() {
    let root = Dir::build(&map_of(&["a", "b", "c"])).unwrap();
    let mut visited = 0;
    let err = root
        .walk(|node| {
            visited += 1;
            if node.name() == "b" {
                return Err(AssetError::NotFound("stop".into()));
            }
            Ok(Walk::Continue)
        })
        .unwrap_err();
    assert!(matches!(err, AssetError::NotFound(_)));
    assert_eq!(visited, 2);
}

#[test]
fn test_file_and_directory_conflict() {
    let err = Dir::build(&map_of(&["a", "a/b"])).unwrap_err();
    assert!(matches!(err, AssetError::PathConflict(ref p) if p == "a"), "{:?}", err);
}

#[test]
fn test_lookup_errors() {
    let root = Dir::build(&map_of(&["docs/readme.md"])).unwrap();
    assert!(matches!(
        root.get("docs/missing"),
        Err(AssetError::NotFound(ref p)) if p == "docs/missing"
    ));
    assert!(matches!(root.get("docs/readme.md/x"), Err(AssetError::NotADirectory(_))));
    assert!(matches!(root.find_asset("docs"), Err(AssetError::NotAFile(_))));
    assert!(matches!(root.get_dir("docs/readme.md"), Err(AssetError::NotADirectory(_))));
    assert!(root.get_dir("").unwrap().is_root());
}

#[test]
fn test_factory_runs_once_under_contention() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = {
        let calls = Arc::clone(&calls);
        Arc::new(Registry::lazy(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(20));
            Ok(map_of(&["one", "two"]))
        }))
    };

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.names().unwrap()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_callers_share_failure() {
    let registry = Arc::new(Registry::lazy(|| {
        Err(AssetError::NotLocated("ASSETBIN_ARCHIVE__X".into()))
    }));
    let barrier = Arc::new(Barrier::new(4));

    let errors: Vec<AssetError> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.get("anything").map(|_| ()).unwrap_err()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let inner: Vec<_> = errors
        .iter()
        .map(|e| match e {
            AssetError::LoadFailed(inner) => Arc::as_ptr(inner),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert!(inner.windows(2).all(|w| w[0] == w[1]));
    assert!(registry.is_loaded());
}

#[test]
fn test_pooled_reads_from_appended_container() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    for i in 0..16u8 {
        fs::write(src.join(format!("asset{:02}", i)), vec![i; 4096 + i as usize]).unwrap();
    }

    let host = dir.path().join("server");
    fs::write(&host, vec![0x7f; 777]).unwrap();
    let mut headers = assetbin_rs::collect_headers(&src).unwrap();
    writer::store_file(&host, &mut headers, &src, &StoreOptions::append()).unwrap();

    let pool = ReaderPool::new(&host, 2).unwrap();
    let registry = {
        let host = host.clone();
        let pool = pool.clone();
        Arc::new(Registry::lazy(move || {
            let container = Container::open_file(&host, &OpenOptions::ended())?;
            Ok(container.assets_map(Arc::new(pool)))
        }))
    };

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..4 {
                    let i = ((t + round) % 16) as u8;
                    let data = registry.get(&format!("asset{:02}", i)).unwrap().data().unwrap();
                    assert_eq!(data.len(), 4096 + i as usize);
                    assert!(data.iter().all(|&b| b == i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(pool.leased(), 0);
    assert!(pool.idle() <= 2);
}

#[test]
fn test_bundle_from_config_candidate() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("public");
    fs::create_dir_all(src.join("css")).unwrap();
    fs::write(src.join("index.html"), b"<h1>hi</h1>").unwrap();
    fs::write(src.join("css/site.css"), b"h1{}").unwrap();

    let dest = dir.path().join("assets.bin");
    let mut headers = assetbin_rs::collect_headers(&src).unwrap();
    writer::store_file(&dest, &mut headers, &src, &StoreOptions::default()).unwrap();

    let config = LoaderConfig::new("tree-registry-config-test")
        .candidate(dir.path().join("missing.bin"))
        .candidate(&dest)
        .verify_digests(true);
    let bundle = AssetBundle::load(config);
    assert!(!bundle.registry().is_loaded());

    assert_eq!(bundle.read("/index.html").unwrap(), b"<h1>hi</h1>");
    assert!(bundle.is_dir("css").unwrap());
    assert!(!bundle.exists("js").unwrap());

    let children: Vec<String> =
        bundle.list_children("").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(children, vec!["css", "index.html"]);

    let css = bundle.entry("css/site.css").unwrap();
    assert_eq!(css.parent, "css");
    assert_eq!(css.size, Some(4));
    assert_eq!(css.depth, 2);
}

#[test]
fn test_restore_directory() {
    let registry = Registry::new(map_of(&["site/a.txt", "site/img/b.png", "other"]));
    let out = TempDir::new().unwrap();

    let count = registry.restore_dir(out.path(), "site").unwrap();
    assert_eq!(count, 2);
    assert_eq!(fs::read(out.path().join("site/a.txt")).unwrap(), b"site/a.txt");
    assert_eq!(fs::read(out.path().join("site/img/b.png")).unwrap(), b"site/img/b.png");
    assert!(!out.path().join("other").exists());

    let all = TempDir::new().unwrap();
    assert_eq!(registry.restore_dir(all.path(), "").unwrap(), 3);
}
