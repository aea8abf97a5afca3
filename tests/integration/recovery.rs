use crate::shared::fixtures::{catalog_tree, execute_sql, inject_row, mounted_tree, TestCheckout};

use edenfs::overlay::OrphanReason;
use edenfs::{ContentRef, EdenError, EdenMount, InodeKind, InodeNumber};
use std::path::PathBuf;

const SIMULATE_CRASH: &str = "DELETE FROM meta WHERE key = 'clean_shutdown';";

const REJECT_INODE_WRITES: &str = "
    CREATE TRIGGER reject_insert BEFORE INSERT ON inodes
      BEGIN SELECT RAISE(ABORT, 'disk full'); END;
    CREATE TRIGGER reject_update BEFORE UPDATE ON inodes
      BEGIN SELECT RAISE(ABORT, 'disk full'); END;";

const ACCEPT_INODE_WRITES: &str = "DROP TRIGGER reject_insert; DROP TRIGGER reject_update;";

#[tokio::test]
async fn test_unclean_shutdown_recovers_open_unlinked_file() {
    let checkout = TestCheckout::new();

    let (kept, unlinked) = {
        let mount = checkout.mount();
        let kept = mount
            .create(InodeNumber::ROOT, "scratch.txt", InodeKind::File)
            .unwrap();
        let unlinked = mount
            .create(InodeNumber::ROOT, "open.log", InodeKind::File)
            .unwrap();
        let held = mount.get_file_inode("open.log").unwrap();
        mount.unlink(InodeNumber::ROOT, "open.log").unwrap();
        assert!(held.is_unlinked());
        // Crash: the mount goes away without destroy.
        drop(held);
        drop(mount);
        (kept, unlinked)
    };

    let mount = checkout.mount();
    let report = mount.overlay().last_fsck().unwrap();
    assert_eq!(report.orphans.len(), 1);
    assert_eq!(report.orphans[0].number, unlinked);
    assert_eq!(report.orphans[0].reason, OrphanReason::Unlinked);

    let scratch = mount.get_file_inode("scratch.txt").unwrap();
    assert_eq!(scratch.number(), kept);
    mount.release(&scratch).unwrap();

    let path = format!("lost+found/{}-open.log", unlinked);
    let recovered = mount.get_file_inode(&path).unwrap();
    assert_eq!(recovered.number(), unlinked);
    mount.release(&recovered).unwrap();

    assert_eq!(mounted_tree(&mount), catalog_tree(mount.overlay()));
    mount.destroy().await;

    // The repaired overlay closes cleanly and needs no second pass.
    let mount = checkout.mount();
    assert!(mount.overlay().last_fsck().is_none());
    mount.destroy().await;
}

#[tokio::test]
async fn test_orphan_injected_between_sessions_lands_in_lost_and_found() {
    let checkout = TestCheckout::new();
    {
        let mount = checkout.mount();
        mount
            .create(InodeNumber::ROOT, "notes", InodeKind::Tree)
            .unwrap();
        mount.destroy().await;
    }

    inject_row(
        &checkout.catalog_path(),
        100,
        Some(99),
        "stray.txt",
        InodeKind::File,
        ContentRef::Local,
    );
    execute_sql(&checkout.catalog_path(), SIMULATE_CRASH);

    let mount = checkout.mount();
    let report = mount.overlay().last_fsck().unwrap();
    assert_eq!(report.dangling_parents, vec![InodeNumber::new(99)]);
    assert_eq!(
        report.allocator_behind.map(|gap| gap.highest),
        Some(InodeNumber::new(100))
    );

    let stray = mount.get_file_inode("lost+found/100-stray.txt").unwrap();
    mount.release(&stray).unwrap();

    // The allocator was raised past the injected row.
    let next = mount
        .create(InodeNumber::ROOT, "fresh.txt", InodeKind::File)
        .unwrap();
    assert!(next > InodeNumber::new(100));
    mount.destroy().await;
}

#[tokio::test]
async fn test_force_fsck_runs_after_clean_shutdown() {
    let checkout = TestCheckout::new();
    {
        let mount = checkout.mount();
        mount
            .create(InodeNumber::ROOT, "kept.txt", InodeKind::File)
            .unwrap();
        mount.destroy().await;
    }
    inject_row(
        &checkout.catalog_path(),
        40,
        Some(40),
        "self-parent",
        InodeKind::Tree,
        ContentRef::Local,
    );

    // Without force the clean marker skips the scan.
    let mut config = checkout.config();
    config.overlay.force_fsck = true;
    let mount = checkout.mount_with(config);
    let report = mount.overlay().last_fsck().unwrap();
    assert_eq!(report.cycles, vec![vec![InodeNumber::new(40)]]);

    let moved = mount.get_tree_inode("lost+found/40-self-parent").unwrap();
    mount.release(&moved).unwrap();
    mount.destroy().await;
}

#[tokio::test]
async fn test_corrupt_row_is_removed_and_children_reattached() {
    let checkout = TestCheckout::new();
    {
        let mount = checkout.mount();
        mount
            .create(InodeNumber::ROOT, "ok.txt", InodeKind::File)
            .unwrap();
        mount.destroy().await;
    }

    let db = checkout.catalog_path();
    execute_sql(
        &db,
        "INSERT INTO inodes (number, parent, name, kind, content)
         VALUES (50, 1, 'bad', 'socket', 'local');",
    );
    inject_row(&db, 51, Some(50), "child", InodeKind::File, ContentRef::Local);
    execute_sql(&db, SIMULATE_CRASH);

    let mount = checkout.mount();
    let report = mount.overlay().last_fsck().unwrap();
    assert_eq!(report.corrupt.len(), 1);
    assert_eq!(report.corrupt[0].number, InodeNumber::new(50));
    assert_eq!(
        report.orphans[0].reason,
        OrphanReason::MissingParent(InodeNumber::new(50))
    );

    assert!(matches!(
        mount.resolve_path("bad"),
        Err(EdenError::NotFound(_))
    ));
    let tree = catalog_tree(mount.overlay());
    assert!(tree.contains_key(&PathBuf::from("ok.txt")));
    assert!(tree.contains_key(&PathBuf::from("lost+found/51-child")));
    mount.destroy().await;
}

#[tokio::test]
async fn test_rejected_write_back_is_kept_and_forces_fsck() {
    let checkout = TestCheckout::new();
    let db = checkout.catalog_path();
    let number = {
        let mount = checkout.mount();
        let readme = mount.get_file_inode("README.md").unwrap();
        let number = readme.number();
        mount.release(&readme).unwrap();
        let before = mount.journal().latest_sequence();

        execute_sql(&db, REJECT_INODE_WRITES);
        let err = mount.materialize_file(number).unwrap_err();
        assert!(matches!(err, EdenError::Catalog(_)), "{:?}", err);
        assert_eq!(mount.journal().latest_sequence(), before);
        assert!(mount.overlay().has_write_failure());

        // The change is still held in memory.
        let parked = mount.inode_map().peek(number).unwrap();
        assert!(parked.is_dirty());
        assert!(!mount
            .overlay()
            .read_entry(number)
            .unwrap()
            .unwrap()
            .content
            .is_local());

        execute_sql(&db, ACCEPT_INODE_WRITES);
        mount.destroy().await;
        number
    };

    let mount = checkout.mount();
    assert!(mount.overlay().last_fsck().is_some());
    let row = mount.overlay().read_entry(number).unwrap().unwrap();
    assert!(row.content.is_local());
    mount.destroy().await;
}

#[tokio::test]
async fn test_corruption_seen_by_mount_forces_fsck() {
    let checkout = TestCheckout::new();
    let number = {
        let mount = checkout.mount();
        let readme = mount.get_file_inode("README.md").unwrap();
        let number = readme.number();
        mount.release(&readme).unwrap();

        execute_sql(
            &checkout.catalog_path(),
            &format!("UPDATE inodes SET kind = 'socket' WHERE number = {};", number),
        );
        let err = mount.resolve_path("README.md").err().unwrap();
        assert!(matches!(err, EdenError::CatalogCorrupt(_)), "{:?}", err);
        assert!(mount.overlay().is_corrupted());
        mount.destroy().await;
        number
    };

    let mount = checkout.mount();
    let report = mount.overlay().last_fsck().unwrap();
    assert_eq!(report.corrupt.len(), 1);
    assert_eq!(report.corrupt[0].number, number);
    mount.destroy().await;
}

#[test]
fn test_unreadable_allocator_refuses_to_mount() {
    let checkout = TestCheckout::new();
    {
        let mount = checkout.mount();
        mount
            .create(InodeNumber::ROOT, "a.txt", InodeKind::File)
            .unwrap();
    }
    execute_sql(
        &checkout.catalog_path(),
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('next_inode', 'garbage');",
    );

    let err = EdenMount::new(checkout.config(), checkout.store.clone())
        .err()
        .unwrap();
    assert!(matches!(err, EdenError::CatalogCorrupt(_)));

    // The failed attempt released the overlay lock.
    let err = EdenMount::new(checkout.config(), checkout.store.clone())
        .err()
        .unwrap();
    assert!(matches!(err, EdenError::CatalogCorrupt(_)));
}
