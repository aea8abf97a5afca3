use edenfs::error::Result;
use edenfs::overlay::{InodeCatalog, SqliteCatalog};
use edenfs::types::{ContentRef, InodeNumber, OverlayEntry};
use std::path::Path;

/// Print the tree reconstructed from an overlay catalog.
pub fn show_overlay(dir: &Path) -> Result<()> {
    let (_lock, catalog) = super::open_offline(dir)?;

    match catalog.read_entry(InodeNumber::ROOT)? {
        Some(root) => {
            println!("/ ({})", describe(&root));
            print_children(&catalog, InodeNumber::ROOT, 1)?;
        }
        None => println!("(no root entry)"),
    }

    catalog.close()?;
    Ok(())
}

fn print_children(catalog: &SqliteCatalog, parent: InodeNumber, depth: usize) -> Result<()> {
    for child in catalog.list_children(parent)? {
        let suffix = if child.is_tree() { "/" } else { "" };
        println!(
            "{}{}{} ({})",
            "  ".repeat(depth),
            child.name,
            suffix,
            describe(&child)
        );
        // Parent links are not trusted here; fsck owns cycle handling.
        if child.is_tree() && child.number != parent && depth < 256 {
            print_children(catalog, child.number, depth + 1)?;
        }
    }
    Ok(())
}

fn describe(entry: &OverlayEntry) -> String {
    match entry.content {
        ContentRef::Local => format!("inode {}, local", entry.number),
        ContentRef::Backing(id) => format!("inode {}, {}", entry.number, id),
    }
}
