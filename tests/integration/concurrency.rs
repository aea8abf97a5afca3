use crate::shared::fixtures::{catalog_tree, mounted_tree, TestCheckout};

use edenfs::{EdenError, InodeKind, InodeNumber, MountState};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_concurrent_creates_produce_gap_free_journal() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let threads = 8;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let mount = Arc::clone(&mount);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    mount
                        .create(InodeNumber::ROOT, &format!("t{}-{}", t, i), InodeKind::File)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = (threads * per_thread) as u64;
    let sequences: Vec<u64> = mount
        .journal()
        .read_since(0)
        .unwrap()
        .iter()
        .map(|d| d.sequence)
        .collect();
    assert_eq!(sequences, (1..=total).collect::<Vec<u64>>());

    // Five snapshot entries plus everything created above.
    let mounted = mounted_tree(&mount);
    assert_eq!(mounted.len(), 5 + total as usize);
    assert_eq!(mounted, catalog_tree(mount.overlay()));
}

#[test]
fn test_concurrent_resolves_share_one_instance() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let mount = Arc::clone(&mount);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                mount.get_file_inode("src/lib.rs").unwrap()
            })
        })
        .collect();
    let inodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(inodes.iter().all(|i| Arc::ptr_eq(i, &inodes[0])));
    let number = inodes[0].number();
    assert_eq!(mount.inode_map().ref_count(number), threads);
    // Root and src were each enumerated from the store exactly once.
    assert_eq!(checkout.store.fetch_count(), 2);

    for inode in &inodes {
        mount.release(inode).unwrap();
    }
    assert_eq!(mount.inode_map().ref_count(number), 0);
}

#[test]
fn test_renames_race_with_path_walks() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let src = mount.get_tree_inode("src").unwrap();
    let docs = mount.get_tree_inode("docs").unwrap();
    let (src_number, docs_number) = (src.number(), docs.number());
    mount.release(&src).unwrap();
    mount.release(&docs).unwrap();

    let mover = {
        let mount = Arc::clone(&mount);
        thread::spawn(move || {
            for _ in 0..50 {
                mount
                    .rename(src_number, "main.rs", docs_number, "main.rs")
                    .unwrap();
                mount
                    .rename(docs_number, "main.rs", src_number, "main.rs")
                    .unwrap();
            }
        })
    };

    let walkers: Vec<_> = (0..4)
        .map(|_| {
            let mount = Arc::clone(&mount);
            thread::spawn(move || {
                let mut found = 0;
                for _ in 0..100 {
                    let _lock = mount.acquire_shared_rename_lock();
                    for path in ["src/main.rs", "docs/main.rs"] {
                        match mount.resolve_path(path) {
                            Ok(inode) => {
                                found += 1;
                                mount.release(&inode).unwrap();
                            }
                            Err(EdenError::NotFound(_)) => {}
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                }
                found
            })
        })
        .collect();

    mover.join().unwrap();
    for walker in walkers {
        // Under one shared hold the file is in exactly one place.
        assert_eq!(walker.join().unwrap(), 100);
    }

    assert_eq!(mounted_tree(&mount), catalog_tree(mount.overlay()));
    assert_eq!(mount.journal().latest_sequence(), 100);
    assert_eq!(mount.inode_map().outstanding_refs(), 1);
}

#[tokio::test]
async fn test_destroy_waits_for_outstanding_references() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let held = mount.get_file_inode("README.md").unwrap();

    let destroying = {
        let mount = Arc::clone(&mount);
        tokio::spawn(async move { mount.destroy().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!destroying.is_finished());
    assert_eq!(mount.state(), MountState::Draining);
    assert!(!mount.overlay().is_closed());
    assert_eq!(
        mount.resolve_path("src").unwrap_err(),
        EdenError::MountShuttingDown
    );

    mount.release(&held).unwrap();
    tokio::time::timeout(Duration::from_secs(5), destroying)
        .await
        .expect("destroy did not complete after the last release")
        .unwrap();
    assert_eq!(mount.state(), MountState::Destroyed);
    assert!(mount.overlay().is_closed());
}

#[tokio::test]
async fn test_release_from_another_thread_completes_destroy() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let held = mount.get_tree_inode("docs").unwrap();

    let releaser = {
        let mount = Arc::clone(&mount);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            mount.release(&held).unwrap();
        })
    };

    tokio::time::timeout(Duration::from_secs(5), mount.destroy())
        .await
        .expect("destroy did not complete");
    releaser.join().unwrap();
    assert_eq!(mount.inode_map().outstanding_refs(), 0);
}
