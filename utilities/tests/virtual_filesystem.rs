use std::io::Write;
use std::path::Path;

use utilities::{FileSystem, VirtualFileSystem};

#[test]
fn write_creates_parents_and_reads_back() {
    let fs = VirtualFileSystem::new();

    fs.write(Path::new("/a/b/c.txt"), b"hello").unwrap();

    let data = fs.read(Path::new("/a/b/c.txt")).unwrap();
    assert_eq!(data, b"hello");

    let md_file = fs.metadata(Path::new("/a/b/c.txt")).unwrap();
    assert!(md_file.is_file);
    assert!(!md_file.is_dir);
    assert_eq!(md_file.len, 5);
}

#[test]
fn read_dir_lists_children() {
    let fs = VirtualFileSystem::new();

    fs.create_dir_all(Path::new("/d/e")).unwrap();
    fs.write(Path::new("/d/e/f1"), b"x").unwrap();
    fs.write(Path::new("/d/e/f2"), b"y").unwrap();

    let mut entries = fs
        .read_dir(Path::new("/d/e"))
        .unwrap()
        .into_iter()
        .map(|e| e.path.file_name().unwrap().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    entries.sort();

    assert_eq!(entries, vec!["f1", "f2"]);
}

#[test]
fn nested_dirs_are_visible_from_parents() {
    let fs = VirtualFileSystem::new();
    fs.write(Path::new("/root/sub/deep/file.bin"), b"z").unwrap();

    let top = fs.read_dir(Path::new("/root")).unwrap();
    assert_eq!(top.len(), 1);
    assert!(top[0].metadata.is_dir);
}

#[test]
fn open_write_streams_and_renames() {
    let fs = VirtualFileSystem::new();

    let mut w = fs.open_write(Path::new("/dl/.file.part")).unwrap();
    w.write_all(b"chunk-one ").unwrap();
    // partial content is observable before the writer is done
    assert_eq!(fs.read(Path::new("/dl/.file.part")).unwrap(), b"chunk-one ");
    w.write_all(b"chunk-two").unwrap();
    w.sync().unwrap();
    drop(w);

    fs.rename(Path::new("/dl/.file.part"), Path::new("/dl/file"))
        .unwrap();
    assert_eq!(fs.read(Path::new("/dl/file")).unwrap(), b"chunk-one chunk-two");
    assert!(fs.read(Path::new("/dl/.file.part")).is_err());
}

#[test]
fn unreadable_paths_surface_permission_denied() {
    let fs = VirtualFileSystem::new();
    fs.write(Path::new("/locked/secret.txt"), b"s").unwrap();
    fs.set_unreadable(Path::new("/locked/secret.txt"));

    let err = fs.read(Path::new("/locked/secret.txt")).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);

    fs.set_unreadable(Path::new("/locked"));
    let err = fs.read_dir(Path::new("/locked")).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
}

#[test]
fn normalizes_dot_dot_segments() {
    let fs = VirtualFileSystem::new();

    fs.write(Path::new("/x/y/../z.txt"), b"ok").unwrap();

    assert_eq!(fs.read(Path::new("/x/z.txt")).unwrap(), b"ok");
    assert!(fs.read(Path::new("/x/y/z.txt")).is_err());
}
