use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use lfs_vfs::{BlockCipher, Geometry, ImageConfig, LfsVfs, MountMode, KEY_TABLE_SIZE};
use native_vfs::NativeVfs;
use rand::{distributions::Alphanumeric, thread_rng, Rng, RngCore as _};
use tree_mirror::{Stats, TreeMirror};
use vfs::Vfs;

#[derive(Debug, PartialEq, Eq)]
enum Node {
    Dir,
    File(Vec<u8>),
}

fn geometry() -> Geometry {
    Geometry {
        block_count: 256,
        ..Geometry::default()
    }
}

fn snapshot(root: &Path) -> BTreeMap<PathBuf, Node> {
    fn walk(root: &Path, dir: &Path, nodes: &mut BTreeMap<PathBuf, Node>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let relative = path.strip_prefix(root).unwrap().to_owned();
            if path.is_dir() {
                nodes.insert(relative, Node::Dir);
                walk(root, &path, nodes);
            } else {
                nodes.insert(relative, Node::File(fs::read(&path).unwrap()));
            }
        }
    }

    let mut nodes = BTreeMap::new();
    walk(root, root, &mut nodes);
    nodes
}

fn random_name() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(thread_rng().gen_range(1..24))
        .map(char::from)
        .collect()
}

fn random_content() -> Vec<u8> {
    let mut content = vec![0; thread_rng().gen_range(0..12_000)];
    thread_rng().fill_bytes(&mut content);
    content
}

/// Fills `root` with a fixed skeleton plus random files, returning the number
/// of directories (root included) and files.
fn fill_tree(root: &Path) -> (usize, usize) {
    let mut d_cnt = 1;
    let mut f_cnt = 0;

    fs::create_dir_all(root.join("was/geht/denn")).unwrap();
    fs::create_dir(root.join("empty")).unwrap();
    d_cnt += 4;
    fs::write(root.join("was/geht/denn/bluba"), b"blablblalbalab").unwrap();
    fs::write(root.join("was/geht/denn/hier"), b"").unwrap();
    fs::write(root.join("was/dort"), (0..=255u8).cycle().take(5000).collect::<Vec<_>>())
        .unwrap();
    f_cnt += 3;

    for dir in [root.to_owned(), root.join("was"), root.join("was/geht")] {
        for _ in 0..thread_rng().gen_range(1..5) {
            let path = dir.join(format!("f-{}", random_name()));
            if !path.exists() {
                fs::write(path, random_content()).unwrap();
                f_cnt += 1;
            }
        }
    }
    (d_cnt, f_cnt)
}

fn create(source: &Path, image: ImageConfig) -> Stats {
    let mut native = NativeVfs::new(source);
    let mut lfs = LfsVfs::new(image);
    native.mount().unwrap();
    lfs.mount().unwrap();

    let stats = TreeMirror::new(&mut native, &mut lfs).run("/").unwrap();

    lfs.unmount().unwrap();
    native.unmount().unwrap();
    stats
}

fn extract(image: ImageConfig, target: &Path) -> Stats {
    let mut lfs = LfsVfs::new(image);
    let mut native = NativeVfs::new(target);
    lfs.mount().unwrap();
    native.mount().unwrap();

    let stats = TreeMirror::new(&mut lfs, &mut native).run("/").unwrap();

    native.unmount().unwrap();
    lfs.unmount().unwrap();
    stats
}

fn round_trip(cipher: Option<BlockCipher>) {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("source");
    let target = work.path().join("target");
    let image = work.path().join("fs.img");
    fs::create_dir(&source).unwrap();
    let (d_cnt, f_cnt) = fill_tree(&source);

    let created = create(
        &source,
        ImageConfig::new(&image, MountMode::Format)
            .geometry(geometry())
            .cipher(cipher.clone()),
    );
    assert_eq!(created.directories, d_cnt);
    assert_eq!(created.files, f_cnt);
    assert_eq!(fs::metadata(&image).unwrap().len(), geometry().image_len());

    let extracted = extract(
        ImageConfig::new(&image, MountMode::ReadOnly)
            .geometry(geometry())
            .cipher(cipher),
        &target,
    );
    assert_eq!(extracted, created);
    assert_eq!(snapshot(&target), snapshot(&source));
}

#[test]
fn plain_round_trip() {
    round_trip(None);
}

#[test]
fn encrypted_round_trip() {
    let mut key = [0u8; 16];
    thread_rng().fill_bytes(&mut key);
    round_trip(Some(BlockCipher::new(&key).unwrap()));
}

#[test]
fn key_table_round_trip() {
    let work = tempfile::tempdir().unwrap();
    let key_file = work.path().join("key.bin");
    let mut table = vec![0u8; KEY_TABLE_SIZE];
    thread_rng().fill_bytes(&mut table);
    fs::write(&key_file, &table).unwrap();

    round_trip(Some(BlockCipher::from_key_file(&key_file).unwrap()));
}

#[test]
fn image_can_be_updated_in_place() {
    let work = tempfile::tempdir().unwrap();
    let first = work.path().join("first");
    let second = work.path().join("second");
    let target = work.path().join("target");
    let image = work.path().join("fs.img");
    fs::create_dir(&first).unwrap();
    fs::create_dir(&second).unwrap();
    fs::write(first.join("kept"), b"kept").unwrap();
    fs::write(first.join("replaced"), b"old content, longer than the new one").unwrap();
    fs::write(second.join("replaced"), b"new").unwrap();
    fs::write(second.join("added"), random_content()).unwrap();

    create(&first, ImageConfig::new(&image, MountMode::Format).geometry(geometry()));
    create(&second, ImageConfig::new(&image, MountMode::ReadWrite).geometry(geometry()));
    extract(ImageConfig::new(&image, MountMode::ReadOnly).geometry(geometry()), &target);

    assert_eq!(fs::read(target.join("kept")).unwrap(), b"kept");
    assert_eq!(fs::read(target.join("replaced")).unwrap(), b"new");
    assert_eq!(
        fs::read(target.join("added")).unwrap(),
        fs::read(second.join("added")).unwrap()
    );
}
