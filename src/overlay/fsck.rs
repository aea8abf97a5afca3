//! Overlay consistency scan and repair.
//!
//! Runs against any `InodeCatalog`, with or without a mount attached. Repair is
//! deterministic: the same catalog contents always produce the same result, and
//! a scan after a successful repair reports no issues.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EdenError, Result};
use crate::overlay::catalog::{InodeCatalog, ScannedRecord};
use crate::types::{ContentRef, InodeKind, InodeNumber, OverlayEntry};

pub const LOST_AND_FOUND: &str = "lost+found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "parent", rename_all = "snake_case")]
pub enum OrphanReason {
    MissingParent(InodeNumber),
    ParentNotTree(InodeNumber),
    /// Non-root row without a parent: unlinked while still referenced.
    Unlinked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub number: InodeNumber,
    pub name: String,
    pub reason: OrphanReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptRecord {
    pub number: InodeNumber,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateName {
    pub parent: InodeNumber,
    pub name: String,
    /// Ascending; the first one keeps the name.
    pub numbers: Vec<InodeNumber>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorGap {
    pub recorded: InodeNumber,
    pub highest: InodeNumber,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    pub entries_scanned: usize,
    /// Root row absent, not a tree, or carrying a parent.
    pub missing_root: bool,
    pub orphans: Vec<Orphan>,
    /// Each cycle starts at its smallest member.
    pub cycles: Vec<Vec<InodeNumber>>,
    pub dangling_parents: Vec<InodeNumber>,
    pub corrupt: Vec<CorruptRecord>,
    pub duplicate_names: Vec<DuplicateName>,
    pub allocator_behind: Option<AllocatorGap>,
}

impl FsckReport {
    pub fn issue_count(&self) -> usize {
        usize::from(self.missing_root)
            + self.orphans.len()
            + self.cycles.len()
            + self.corrupt.len()
            + self.duplicate_names.len()
            + usize::from(self.allocator_behind.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub root_recreated: bool,
    pub removed_corrupt: usize,
    pub renamed: usize,
    pub reattached: usize,
    pub lost_and_found: Option<InodeNumber>,
    pub allocator_raised_to: Option<InodeNumber>,
}

pub struct FsckScanner;

impl FsckScanner {
    /// Validate every row of the catalog.
    ///
    /// Fails only when the catalog cannot be read at all, including an
    /// unreadable allocator record, which no repair can recover from.
    pub fn scan(catalog: &dyn InodeCatalog) -> Result<FsckReport> {
        let recorded = catalog.high_water_mark()?;
        let records = catalog.scan_records()?;

        let mut report = FsckReport {
            entries_scanned: records.len(),
            ..FsckReport::default()
        };
        let mut entries: BTreeMap<InodeNumber, OverlayEntry> = BTreeMap::new();
        let mut highest = InodeNumber::ROOT;
        for record in records {
            match record {
                ScannedRecord::Valid(entry) => {
                    highest = highest.max(entry.number);
                    entries.insert(entry.number, entry);
                }
                ScannedRecord::Corrupt { number, reason } => {
                    highest = highest.max(number);
                    report.corrupt.push(CorruptRecord { number, reason });
                }
            }
        }

        report.missing_root = !matches!(
            entries.get(&InodeNumber::ROOT),
            Some(root) if root.is_tree() && root.parent.is_none()
        );

        // The root always counts as a valid tree parent: repair recreates it.
        let is_tree = |number: InodeNumber| {
            number.is_root() || entries.get(&number).is_some_and(|e| e.is_tree())
        };

        let mut dangling = BTreeSet::new();
        let mut linked: BTreeMap<InodeNumber, InodeNumber> = BTreeMap::new();
        for entry in entries.values().filter(|e| !e.number.is_root()) {
            let reason = match entry.parent {
                None => Some(OrphanReason::Unlinked),
                Some(parent) if !parent.is_root() && !entries.contains_key(&parent) => {
                    dangling.insert(parent);
                    Some(OrphanReason::MissingParent(parent))
                }
                Some(parent) if !is_tree(parent) => Some(OrphanReason::ParentNotTree(parent)),
                Some(parent) => {
                    linked.insert(entry.number, parent);
                    None
                }
            };
            if let Some(reason) = reason {
                report.orphans.push(Orphan {
                    number: entry.number,
                    name: entry.name.clone(),
                    reason,
                });
            }
        }
        report.dangling_parents = dangling.into_iter().collect();
        report.cycles = find_cycles(&linked);

        let mut by_name: BTreeMap<(InodeNumber, &str), Vec<InodeNumber>> = BTreeMap::new();
        for (number, parent) in &linked {
            if let Some(entry) = entries.get(number) {
                by_name
                    .entry((*parent, entry.name.as_str()))
                    .or_default()
                    .push(*number);
            }
        }
        report.duplicate_names = by_name
            .into_iter()
            .filter(|(_, numbers)| numbers.len() > 1)
            .map(|((parent, name), numbers)| DuplicateName {
                parent,
                name: name.to_string(),
                numbers,
            })
            .collect();

        if highest > recorded {
            report.allocator_behind = Some(AllocatorGap { recorded, highest });
        }

        Ok(report)
    }

    /// Fix everything `report` describes.
    pub fn repair(catalog: &dyn InodeCatalog, report: &FsckReport) -> Result<RepairSummary> {
        let mut summary = RepairSummary::default();

        // Raise the allocator first so lost+found never reuses a live number.
        if let Some(gap) = report.allocator_behind {
            catalog.record_allocation(gap.highest)?;
            summary.allocator_raised_to = Some(gap.highest);
        }

        for corrupt in &report.corrupt {
            catalog.remove_entry(corrupt.number)?;
            summary.removed_corrupt += 1;
        }

        if report.missing_root {
            let content = match catalog.read_entry(InodeNumber::ROOT) {
                Ok(Some(root)) if root.is_tree() => root.content,
                _ => ContentRef::Local,
            };
            catalog.write_entry(&OverlayEntry::new(
                InodeNumber::ROOT,
                None,
                "",
                InodeKind::Tree,
                content,
            ))?;
            summary.root_recreated = true;
        }

        for duplicate in &report.duplicate_names {
            for number in duplicate.numbers.iter().skip(1) {
                if let Some(mut entry) = catalog.read_entry(*number)? {
                    entry.name = format!("{}.{}", entry.name, number);
                    catalog.write_entry(&entry)?;
                    summary.renamed += 1;
                }
            }
        }

        let detached: BTreeSet<InodeNumber> = report
            .orphans
            .iter()
            .map(|o| o.number)
            .chain(report.cycles.iter().flatten().copied())
            .collect();
        if !detached.is_empty() {
            let lost_and_found = ensure_lost_and_found(catalog)?;
            for number in detached {
                if let Some(mut entry) = catalog.read_entry(number)? {
                    entry.name = if entry.name.is_empty() {
                        number.to_string()
                    } else {
                        format!("{}-{}", number, entry.name)
                    };
                    entry.parent = Some(lost_and_found);
                    catalog.write_entry(&entry)?;
                    summary.reattached += 1;
                }
            }
            summary.lost_and_found = Some(lost_and_found);
        }

        catalog.flush()?;
        tracing::info!(
            "Overlay repair: {} reattached, {} corrupt removed, {} renamed",
            summary.reattached,
            summary.removed_corrupt,
            summary.renamed
        );
        Ok(summary)
    }

    /// Scan, repair if needed, and verify the result.
    pub fn check_and_repair(catalog: &dyn InodeCatalog) -> Result<FsckReport> {
        let report = Self::scan(catalog)?;
        if report.is_clean() {
            return Ok(report);
        }
        tracing::warn!("Overlay fsck found {} issue(s)", report.issue_count());
        Self::repair(catalog, &report)?;
        let after = Self::scan(catalog)?;
        if !after.is_clean() {
            return Err(EdenError::CatalogCorrupt(format!(
                "{} issue(s) remain after repair",
                after.issue_count()
            )));
        }
        Ok(report)
    }
}

/// Find cycles in the child -> parent graph. Iteration is in number order so
/// the result is deterministic.
fn find_cycles(parents: &BTreeMap<InodeNumber, InodeNumber>) -> Vec<Vec<InodeNumber>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        OnPath,
        Done,
    }

    let mut marks: BTreeMap<InodeNumber, Mark> = BTreeMap::new();
    let mut cycles = Vec::new();

    for &start in parents.keys() {
        if marks.contains_key(&start) {
            continue;
        }
        let mut path = Vec::new();
        let mut current = Some(start);
        while let Some(number) = current {
            match marks.get(&number) {
                Some(Mark::Done) => break,
                Some(Mark::OnPath) => {
                    if let Some(pos) = path.iter().position(|n| *n == number) {
                        let mut cycle: Vec<InodeNumber> = path[pos..].to_vec();
                        if let Some(min_pos) = cycle
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, n)| **n)
                            .map(|(i, _)| i)
                        {
                            cycle.rotate_left(min_pos);
                        }
                        cycles.push(cycle);
                    }
                    break;
                }
                None => {
                    marks.insert(number, Mark::OnPath);
                    path.push(number);
                    current = parents.get(&number).copied();
                }
            }
        }
        for number in path {
            marks.insert(number, Mark::Done);
        }
    }

    cycles
}

fn ensure_lost_and_found(catalog: &dyn InodeCatalog) -> Result<InodeNumber> {
    let existing = catalog
        .list_children(InodeNumber::ROOT)?
        .into_iter()
        .find(|e| e.name == LOST_AND_FOUND);
    let name = match existing {
        Some(entry) if entry.is_tree() => return Ok(entry.number),
        Some(_) => None,
        None => Some(LOST_AND_FOUND.to_string()),
    };

    let number = catalog.allocate_next()?;
    let name = name.unwrap_or_else(|| format!("{}.{}", LOST_AND_FOUND, number));
    catalog.write_entry(&OverlayEntry::new(
        number,
        Some(InodeNumber::ROOT),
        name,
        InodeKind::Tree,
        ContentRef::Local,
    ))?;
    Ok(number)
}
