use edenfs::error::Result;
use edenfs::overlay::{FsckReport, FsckScanner, InodeCatalog, OrphanReason, RepairSummary};
use std::path::Path;

pub const EXIT_ISSUES_REMAIN: i32 = 1;
pub const EXIT_UNREPAIRABLE: i32 = 2;

/// Scan an overlay directory and repair it unless `dry_run` is set.
///
/// Returns the process exit code: 0 when the overlay is clean or was
/// repaired, [`EXIT_ISSUES_REMAIN`] when a dry run found problems, and
/// [`EXIT_UNREPAIRABLE`] when repair did not converge. Errors (including an
/// unreadable allocator record) are unrepairable too.
pub fn run_fsck(dir: &Path, dry_run: bool, json: bool) -> Result<i32> {
    let (_lock, catalog) = super::open_offline(dir)?;
    let report = FsckScanner::scan(&catalog)?;

    if report.is_clean() || dry_run {
        if report.is_clean() && !dry_run {
            catalog.set_clean_shutdown(true)?;
        }
        print_result(dir, &report, None, json)?;
        catalog.close()?;
        return Ok(if report.is_clean() { 0 } else { EXIT_ISSUES_REMAIN });
    }

    let summary = FsckScanner::repair(&catalog, &report)?;
    let after = FsckScanner::scan(&catalog)?;
    print_result(dir, &report, Some(&summary), json)?;

    if !after.is_clean() {
        eprintln!(
            "Error: {} issue(s) remain after repair",
            after.issue_count()
        );
        catalog.close()?;
        return Ok(EXIT_UNREPAIRABLE);
    }

    catalog.set_clean_shutdown(true)?;
    catalog.close()?;
    Ok(0)
}

fn print_result(
    dir: &Path,
    report: &FsckReport,
    summary: Option<&RepairSummary>,
    json: bool,
) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "overlay": dir.display().to_string(),
            "clean": report.is_clean(),
            "report": report,
            "repair": summary,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "Scanned {} entries in {}",
        report.entries_scanned,
        dir.display()
    );
    if report.is_clean() {
        println!("No problems found");
        return Ok(());
    }

    println!("Found {} problem(s):", report.issue_count());
    if report.missing_root {
        println!("  root entry missing or invalid");
    }
    for orphan in &report.orphans {
        let reason = match orphan.reason {
            OrphanReason::MissingParent(parent) => format!("parent {} does not exist", parent),
            OrphanReason::ParentNotTree(parent) => format!("parent {} is not a directory", parent),
            OrphanReason::Unlinked => "unlinked".to_string(),
        };
        println!("  orphan {} '{}': {}", orphan.number, orphan.name, reason);
    }
    for cycle in &report.cycles {
        let members: Vec<String> = cycle.iter().map(|n| n.to_string()).collect();
        println!("  cycle {}", members.join(" -> "));
    }
    for corrupt in &report.corrupt {
        println!("  corrupt row {}: {}", corrupt.number, corrupt.reason);
    }
    for duplicate in &report.duplicate_names {
        println!(
            "  duplicate name '{}' under {} ({} entries)",
            duplicate.name,
            duplicate.parent,
            duplicate.numbers.len()
        );
    }
    if let Some(gap) = report.allocator_behind {
        println!(
            "  allocator at {} but entries go up to {}",
            gap.recorded, gap.highest
        );
    }

    match summary {
        Some(summary) => {
            println!();
            println!("Repaired:");
            if summary.root_recreated {
                println!("  recreated root");
            }
            if summary.reattached > 0 {
                println!("  reattached {} entries under lost+found", summary.reattached);
            }
            if summary.removed_corrupt > 0 {
                println!("  removed {} corrupt rows", summary.removed_corrupt);
            }
            if summary.renamed > 0 {
                println!("  renamed {} duplicates", summary.renamed);
            }
            if let Some(mark) = summary.allocator_raised_to {
                println!("  raised allocator to {}", mark);
            }
        }
        None => println!("Dry run: nothing was changed"),
    }
    Ok(())
}
