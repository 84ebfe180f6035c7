use std::fs;

use tempfile::TempDir;
use vfs::{EntryKind, Error, OpenFlags, Vfs};

use crate::NativeVfs;

fn mounted() -> (TempDir, NativeVfs) {
    let dir = tempfile::tempdir().unwrap();
    let mut vfs = NativeVfs::new(dir.path());
    vfs.mount().unwrap();
    (dir, vfs)
}

fn collect(vfs: &mut NativeVfs, path: &str) -> Vec<(String, EntryKind)> {
    let mut dir = vfs.open_dir(path).unwrap();
    let mut entries = Vec::new();
    while let Some(entry) = vfs.read_dir(&mut dir).unwrap() {
        entries.push((entry.name().to_owned(), entry.kind()));
    }
    vfs.close_dir(dir).unwrap();
    entries.sort();
    entries
}

#[test]
fn operations_require_mount() {
    let dir = tempfile::tempdir().unwrap();
    let mut vfs = NativeVfs::new(dir.path());
    assert!(matches!(vfs.open_dir("/"), Err(Error::NotMounted)));
    assert!(matches!(vfs.mkdir("/a"), Err(Error::NotMounted)));
    assert!(matches!(vfs.unmount(), Err(Error::NotMounted)));
}

#[test]
fn mkdir_is_idempotent() {
    let (root, mut vfs) = mounted();
    vfs.mkdir("/a").unwrap();
    vfs.mkdir("/a").unwrap();
    vfs.mkdir("/").unwrap();
    assert!(root.path().join("a").is_dir());
}

#[test]
fn mkdir_does_not_create_parents() {
    let (_root, mut vfs) = mounted();
    assert!(matches!(vfs.mkdir("/missing/child"), Err(Error::NotFound(_))));
}

#[test]
fn empty_directory_ends_immediately() {
    let (_root, mut vfs) = mounted();
    vfs.mkdir("/empty").unwrap();
    let mut dir = vfs.open_dir("/empty").unwrap();
    assert_eq!(vfs.read_dir(&mut dir).unwrap(), None);
    vfs.close_dir(dir).unwrap();
}

#[test]
fn entries_are_classified() {
    let (root, mut vfs) = mounted();
    fs::create_dir(root.path().join("sub")).unwrap();
    fs::write(root.path().join("file"), b"data").unwrap();

    assert_eq!(
        collect(&mut vfs, "/"),
        vec![
            ("file".to_owned(), EntryKind::File),
            ("sub".to_owned(), EntryKind::Directory),
        ]
    );
}

#[cfg(unix)]
#[test]
fn dangling_symlink_fails_enumeration() {
    let (root, mut vfs) = mounted();
    std::os::unix::fs::symlink(root.path().join("nowhere"), root.path().join("link")).unwrap();

    let mut dir = vfs.open_dir("/").unwrap();
    assert!(vfs.read_dir(&mut dir).is_err());
    vfs.close_dir(dir).unwrap();
}

#[cfg(unix)]
#[test]
fn socket_is_an_unsupported_entry() {
    let (root, mut vfs) = mounted();
    let _listener = std::os::unix::net::UnixListener::bind(root.path().join("sock")).unwrap();

    let mut dir = vfs.open_dir("/").unwrap();
    assert!(matches!(
        vfs.read_dir(&mut dir),
        Err(Error::UnsupportedEntry(_))
    ));
    vfs.close_dir(dir).unwrap();
}

#[test]
fn read_is_short_only_at_end_of_file() {
    let (root, mut vfs) = mounted();
    let content: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    fs::write(root.path().join("data"), &content).unwrap();

    let mut file = vfs.open("/data", OpenFlags::READ_ONLY).unwrap();
    let mut buf = [0u8; 400];
    assert_eq!(vfs.read(&mut file, &mut buf).unwrap(), 400);
    assert_eq!(buf[..], content[..400]);
    assert_eq!(vfs.read(&mut file, &mut buf).unwrap(), 400);
    assert_eq!(vfs.read(&mut file, &mut buf).unwrap(), 200);
    assert_eq!(buf[..200], content[800..]);
    assert_eq!(vfs.read(&mut file, &mut buf).unwrap(), 0);
    vfs.close(file).unwrap();
}

#[test]
fn create_truncates_existing_file() {
    let (root, mut vfs) = mounted();
    fs::write(root.path().join("out"), b"previous content").unwrap();

    let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE_ONLY;
    let mut file = vfs.open("/out", flags).unwrap();
    assert_eq!(vfs.write(&mut file, b"new").unwrap(), 3);
    vfs.close(file).unwrap();

    assert_eq!(fs::read(root.path().join("out")).unwrap(), b"new");
}

#[test]
fn missing_file_is_not_found() {
    let (_root, mut vfs) = mounted();
    assert!(matches!(
        vfs.open("/absent", OpenFlags::READ_ONLY),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(vfs.open_dir("/absent"), Err(Error::NotFound(_))));
}

#[test]
fn paths_cannot_escape_root() {
    let (_root, mut vfs) = mounted();
    assert!(matches!(
        vfs.open("/../outside", OpenFlags::READ_ONLY),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn root_must_be_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain");
    fs::write(&file, b"").unwrap();
    assert!(matches!(
        NativeVfs::new(file).mount(),
        Err(Error::InvalidArgument(_))
    ));
}
