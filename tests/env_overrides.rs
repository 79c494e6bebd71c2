//! Behavior driven by process environment variables
//!
//! Every test here mutates the environment, so they all hold `ENV_LOCK`.

use assetbin_rs::core::container::{gz_sibling, KEEP_GZ_ENV};
use assetbin_rs::core::writer;
use assetbin_rs::{
    collect_headers, env_var_name, AssetBundle, Container, LoaderConfig, Locator, OpenOptions,
    StoreOptions,
};
use parking_lot::Mutex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn gzip_container(dir: &Path) -> PathBuf {
    let src = dir.join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("index.html"), b"<p>env</p>").unwrap();

    let dest = dir.join("bundle.bin");
    let mut headers = collect_headers(&src).unwrap();
    let options = StoreOptions::default().gzip(true);
    writer::store_file(&dest, &mut headers, &src, &options).unwrap();
    dest
}

#[test]
fn test_keep_gz_variable_keeps_archive() {
    let _guard = ENV_LOCK.lock();
    let dir = TempDir::new().unwrap();
    let dest = gzip_container(dir.path());

    env::set_var(KEEP_GZ_ENV, "1");
    let kept = Container::open_file(&dest, &OpenOptions::standalone());
    env::remove_var(KEEP_GZ_ENV);

    assert_eq!(kept.unwrap().len(), 1);
    assert!(dest.exists());
    assert!(gz_sibling(&dest).exists());
}

#[test]
fn test_unset_keep_gz_removes_archive() {
    let _guard = ENV_LOCK.lock();
    let dir = TempDir::new().unwrap();
    let dest = gzip_container(dir.path());

    env::remove_var(KEEP_GZ_ENV);
    let c = Container::open_file(&dest, &OpenOptions::standalone()).unwrap();
    assert_eq!(c.len(), 1);
    assert!(dest.exists());
    assert!(!gz_sibling(&dest).exists());
}

#[test]
fn test_explicit_option_beats_keep_gz_variable() {
    let _guard = ENV_LOCK.lock();
    let dir = TempDir::new().unwrap();
    let dest = gzip_container(dir.path());

    env::set_var(KEEP_GZ_ENV, "1");
    let opened = Container::open_file(&dest, &OpenOptions::standalone().keep_compressed(false));
    env::remove_var(KEEP_GZ_ENV);

    opened.unwrap();
    assert!(!gz_sibling(&dest).exists());
}

#[test]
fn test_archive_variable_overrides_candidates() {
    let _guard = ENV_LOCK.lock();
    let dir = TempDir::new().unwrap();
    let dest = gzip_container(dir.path());
    let package = "env-overrides-demo";
    let var = env_var_name(package).unwrap();
    assert_eq!(var, "ASSETBIN_ARCHIVE__ENV_OVERRIDES_DEMO");

    let missing = dir.path().join("missing.bin");
    let joined = env::join_paths([missing.clone(), dest.clone()]).unwrap();
    env::set_var(&var, &joined);

    let located = Locator::new(package)
        .unwrap()
        .candidate(dir.path().join("also-missing.bin"))
        .locate();
    let bundle = AssetBundle::load(LoaderConfig::new(package).candidate(&missing));
    let page = bundle.read("index.html");
    env::remove_var(&var);

    assert_eq!(located.unwrap().path, dest);
    assert_eq!(page.unwrap(), b"<p>env</p>");
}
