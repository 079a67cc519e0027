//! # Orphan sweep
//!
//! Finds blobs that no ledger row refers to. These are left behind when a
//! process dies between writing a blob and committing its reference, or
//! between committing a delete and erasing the bytes.

use anyhow::{Context, Result};
use clap::Args;
use nimbus_vfs::Drive;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Actually delete orphaned blobs (default is dry-run)
    #[arg(long)]
    delete: bool,

    /// List every orphan fingerprint
    #[arg(short, long)]
    verbose: bool,
}

pub fn run(drive: &Drive, args: GcArgs) -> Result<()> {
    println!();
    println!("  Nimbus Garbage Collection");
    println!("  =========================");

    let before = drive
        .blobs()
        .stats()
        .context("Failed to scan blob store")?;
    let report = drive
        .sweep_orphans(!args.delete)
        .context("Orphan sweep failed")?;
    let orphan_count = report.orphans.len() as u64;

    println!();
    println!("  Blob Store:");
    println!(
        "    📦 Total blobs:   {} ({})",
        format_number(before.blob_count),
        format_bytes(before.total_bytes)
    );
    println!(
        "    ✅ Referenced:    {}",
        format_number(report.blobs_scanned.saturating_sub(orphan_count))
    );
    println!(
        "    🗑️  Orphaned:      {} ({})",
        format_number(orphan_count),
        format_bytes(report.orphan_bytes)
    );

    if orphan_count > 0 && before.total_bytes > 0 {
        let reclaim_pct = (report.orphan_bytes as f64 / before.total_bytes as f64) * 100.0;
        println!("    💾 Reclaimable:   {:.1}% of store", reclaim_pct);
    }

    if args.verbose {
        for fingerprint in &report.orphans {
            println!("      {}", fingerprint);
        }
    }

    println!();
    if orphan_count == 0 {
        println!("  ✨ Nothing to collect.");
    } else if report.deleted {
        println!(
            "  🗑️  Deleted {} orphaned blobs, freed {}",
            format_number(orphan_count),
            format_bytes(report.orphan_bytes)
        );
    } else {
        println!("  💡 Dry run. Re-run with --delete to remove orphaned blobs.");
    }
    println!();

    Ok(())
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format number with comma separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
