use crate::shared::fixtures::{catalog_tree, mounted_tree, TestCheckout};

use edenfs::config::BindMount;
use edenfs::{
    CatalogKind, EdenError, InodeCatalog, InodeKind, InodeNumber, MountState, PathChange,
};
use proptest::prelude::*;
use std::path::PathBuf;

#[test]
fn test_snapshot_is_visible_through_the_mount() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();

    let tree = mounted_tree(&mount);
    let paths: Vec<&str> = tree.keys().filter_map(|p| p.to_str()).collect();
    assert_eq!(
        paths,
        vec!["README.md", "docs", "src", "src/lib.rs", "src/main.rs"]
    );
    assert_eq!(tree[&PathBuf::from("docs")], InodeKind::Tree);
}

#[test]
fn test_catalog_matches_inode_map_after_every_operation() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let src = mount.get_tree_inode("src").unwrap().number();
    let docs = mount.get_tree_inode("docs").unwrap().number();
    mount.inode_map().release(src).unwrap();
    mount.inode_map().release(docs).unwrap();

    let apply = |step: usize| -> edenfs::Result<()> {
        match step {
            0 => mount.create(docs, "guide.md", InodeKind::File).map(|_| ()),
            1 => mount
                .create(InodeNumber::ROOT, "build", InodeKind::Tree)
                .map(|_| ()),
            2 => mount.rename(src, "main.rs", docs, "main.rs"),
            3 => mount.rename(InodeNumber::ROOT, "docs", src, "docs"),
            4 => mount.unlink(InodeNumber::ROOT, "README.md"),
            5 => mount.rename(src, "lib.rs", InodeNumber::ROOT, "build.rs"),
            _ => mount.unlink(InodeNumber::ROOT, "build"),
        }
    };
    let steps = 7;

    for step in 0..steps {
        apply(step).unwrap_or_else(|e| panic!("step {} failed: {}", step, e));
        let mounted = mounted_tree(&mount);
        let persisted = catalog_tree(mount.overlay());
        assert_eq!(mounted, persisted, "trees diverged after step {}", step);
    }

    let final_paths: Vec<String> = catalog_tree(mount.overlay())
        .keys()
        .map(|p| p.display().to_string())
        .collect();
    assert_eq!(
        final_paths,
        vec![
            "build.rs",
            "src",
            "src/docs",
            "src/docs/guide.md",
            "src/docs/main.rs"
        ]
    );
    assert_eq!(mount.journal().latest_sequence(), steps as u64);
}

#[test]
fn test_journal_records_each_structural_change() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    let rx = mount.journal().subscribe();

    mount
        .create(InodeNumber::ROOT, "notes.txt", InodeKind::File)
        .unwrap();
    mount
        .rename(InodeNumber::ROOT, "notes.txt", InodeNumber::ROOT, "todo.txt")
        .unwrap();
    let todo = mount.get_file_inode("todo.txt").unwrap();
    let number = todo.number();
    mount.release(&todo).unwrap();
    mount.materialize_file(number).unwrap();

    let deltas = mount.journal().read_since(0).unwrap();
    assert_eq!(deltas.len(), 3);
    assert_eq!(*rx.borrow(), 3);
    assert_eq!(
        deltas[1].changes,
        vec![PathChange::Renamed {
            from: "notes.txt".into(),
            to: "todo.txt".into()
        }]
    );
    assert_eq!(
        deltas[2].changes,
        vec![PathChange::Modified {
            path: "todo.txt".into()
        }]
    );
    assert!(deltas
        .iter()
        .all(|d| d.from_root == Some(checkout.snapshot)));

    let tail = mount.journal().read_since(2).unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].sequence, 3);
}

#[test]
fn test_journal_horizon_forces_resync() {
    let checkout = TestCheckout::new();
    let mut config = checkout.config();
    config.journal.max_deltas = Some(2);
    let mount = checkout.mount_with(config);

    for name in ["a", "b", "c", "d"] {
        mount
            .create(InodeNumber::ROOT, name, InodeKind::File)
            .unwrap();
    }

    assert_eq!(
        mount.journal().read_since(1).unwrap_err(),
        EdenError::JournalTruncated {
            cursor: 1,
            oldest: 3
        }
    );
    assert_eq!(mount.journal().read_since(2).unwrap().len(), 2);
}

#[tokio::test]
async fn test_remount_restores_local_changes() {
    let checkout = TestCheckout::new();

    let (created, highest) = {
        let mount = checkout.mount();
        let created = mount
            .create(InodeNumber::ROOT, "local.txt", InodeKind::File)
            .unwrap();
        mount
            .rename(InodeNumber::ROOT, "README.md", InodeNumber::ROOT, "README.old")
            .unwrap();
        let highest = mount.overlay().catalog().high_water_mark().unwrap();
        mount.destroy().await;
        assert_eq!(mount.state(), MountState::Destroyed);
        (created, highest)
    };

    let mount = checkout.mount();
    assert!(mount.overlay().last_fsck().is_none());
    assert_eq!(mount.journal().latest_sequence(), 0);

    let local = mount.get_file_inode("local.txt").unwrap();
    assert_eq!(local.number(), created);
    mount.release(&local).unwrap();
    assert!(matches!(
        mount.resolve_path("README.md"),
        Err(EdenError::NotFound(_))
    ));

    let next = mount
        .create(InodeNumber::ROOT, "after.txt", InodeKind::File)
        .unwrap();
    assert!(next > highest);
    mount.destroy().await;
}

#[tokio::test]
async fn test_buffered_catalog_mount() {
    let checkout = TestCheckout::new();
    let mut config = checkout.config();
    config.overlay.catalog = CatalogKind::Buffered;
    config.overlay.buffer_depth = Some(4);
    config.overlay.flush_batch_size = Some(2);

    {
        let mount = checkout.mount_with(config.clone());
        let dir = mount
            .create(InodeNumber::ROOT, "generated", InodeKind::Tree)
            .unwrap();
        for i in 0..20 {
            mount
                .create(dir, &format!("file-{:02}", i), InodeKind::File)
                .unwrap();
        }
        mount
            .rename(dir, "file-00", InodeNumber::ROOT, "first")
            .unwrap();
        assert_eq!(mounted_tree(&mount), catalog_tree(mount.overlay()));
        mount.destroy().await;
    }

    let mut direct = config;
    direct.overlay.catalog = CatalogKind::Direct;
    let mount = checkout.mount_with(direct);
    assert!(mount.overlay().last_fsck().is_none());
    let tree = catalog_tree(mount.overlay());
    assert!(tree.contains_key(&PathBuf::from("first")));
    assert!(tree.contains_key(&PathBuf::from("generated/file-19")));
    assert!(!tree.contains_key(&PathBuf::from("generated/file-00")));
    mount.destroy().await;
}

#[test]
fn test_overlay_in_use_rejects_second_mount() {
    let checkout = TestCheckout::new();
    let _mount = checkout.mount();
    let err = edenfs::EdenMount::new(checkout.config(), checkout.store.clone())
        .err()
        .unwrap();
    assert!(matches!(err, EdenError::OverlayLocked(_)));
}

#[test]
fn test_store_outage_is_retryable() {
    let checkout = TestCheckout::new();
    let mount = checkout.mount();
    checkout.store.set_available(false);

    let err = mount.resolve_path("src/main.rs").unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.errno(), libc::EAGAIN);
    assert_eq!(mount.inode_map().outstanding_refs(), 1);

    checkout.store.set_available(true);
    let main = mount.get_file_inode("src/main.rs").unwrap();
    mount.release(&main).unwrap();
}

#[test]
fn test_mount_accessors() {
    let checkout = TestCheckout::new();
    let mut config = checkout.config();
    config.bind_mounts.push(BindMount {
        client_path: checkout.temp_dir.path().join("cache"),
        mount_path: PathBuf::from("buck-out"),
    });
    let first = checkout.mount_with(config);
    assert_eq!(first.bind_mounts().len(), 1);
    assert_eq!(first.state(), MountState::Running);
    assert_eq!(first.config().snapshot, Some(checkout.snapshot));

    let other = TestCheckout::new();
    let second = other.mount();
    assert_ne!(first.generation(), second.generation());

    let lock = first.acquire_rename_lock();
    assert!(lock.is_held(&first));
    assert!(!lock.is_held(&second));
    drop(lock);

    let shared = second.acquire_shared_rename_lock();
    assert!(shared.is_held(&second));
}

const NAMES: [&str; 4] = ["a", "b", "c", "d"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]
    #[test]
    fn test_random_operations_keep_catalog_in_sync(
        ops in prop::collection::vec((0..4u8, 0..3usize, 0..4usize), 1..24)
    ) {
        let checkout = TestCheckout::new();
        let mount = checkout.mount();
        let src = mount.get_tree_inode("src").unwrap();
        let docs = mount.get_tree_inode("docs").unwrap();
        let dirs = [InodeNumber::ROOT, src.number(), docs.number()];
        mount.release(&src).unwrap();
        mount.release(&docs).unwrap();

        let mut applied = 0;
        for (op, d, n) in ops {
            let (dir, name) = (dirs[d], NAMES[n]);
            let result = match op {
                0 => mount.create(dir, name, InodeKind::File).map(|_| ()),
                1 => mount.create(dir, name, InodeKind::Tree).map(|_| ()),
                2 => mount.rename(dir, name, dirs[(d + 1) % 3], NAMES[(n + 1) % 4]),
                _ => mount.unlink(dir, name),
            };
            if result.is_ok() {
                applied += 1;
            }
            prop_assert_eq!(mounted_tree(&mount), catalog_tree(mount.overlay()));
        }
        // Failed operations leave no journal entry behind.
        prop_assert_eq!(mount.journal().latest_sequence(), applied);
        prop_assert_eq!(mount.inode_map().outstanding_refs(), 1);
    }
}
