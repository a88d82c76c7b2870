use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexer::{spawn_watcher, FileIndex};
use tokio_util::sync::CancellationToken;
use utilities::RealFileSystem;

#[test]
fn scans_a_real_directory_tree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hi\n").unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/report.pdf"), [0u8; 32]).unwrap();
    std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

    let index = FileIndex::new(
        PathBuf::from(dir.path()),
        Arc::new(RealFileSystem::new()),
    );
    assert_eq!(index.rescan(), 2);

    let files = index.files();
    assert_eq!(files[0].relative_path, "docs/report.pdf");
    assert_eq!(files[0].mime_type, "application/pdf");
    assert_eq!(files[1].relative_path, "hello.txt");
    assert_eq!(files[1].size, 3);
    assert!(files[1].last_modified > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_rescans_after_changes_settle() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("first.txt"), b"1").unwrap();

    let index = Arc::new(FileIndex::new(
        PathBuf::from(dir.path()),
        Arc::new(RealFileSystem::new()),
    ));
    index.rescan();
    assert_eq!(index.files().len(), 1);

    let token = CancellationToken::new();
    let _watcher = spawn_watcher(Arc::clone(&index), token.clone());
    tokio::time::sleep(Duration::from_millis(300)).await;

    std::fs::write(dir.path().join("second.txt"), b"2").unwrap();
    std::fs::write(dir.path().join("third.txt"), b"3").unwrap();

    let mut seen = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        seen = index.files().len();
        if seen == 3 {
            break;
        }
    }
    token.cancel();
    assert_eq!(seen, 3, "watcher never picked up the new files");
}
