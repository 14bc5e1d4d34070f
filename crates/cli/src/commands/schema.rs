use anyhow::{anyhow, bail};
use pgfast_core::{DatabaseConfig, DEFAULT_MIGRATIONS_DIR};
use pgfast_schema::{
    create_migration, ApplyReport, DependencyReport, DownOptions, DownTarget, MigrationEngine,
    MigrationPlan, MigrationRollback, MigrationStatusReport, RollbackReport, UpOptions, Version,
    VerifyOutcome, VerifyReport,
};
use std::path::PathBuf;

use crate::utils::{indent, join_versions, short_checksum};

pub fn create(config: &DatabaseConfig, name: &str, no_depends: bool) -> anyhow::Result<()> {
    let dir = config
        .migrations_dirs
        .first()
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR));
    let created = create_migration(&dir, &config.migrations_dirs, name, !no_depends)?;

    println!("✅ Created migration {} ({})", created.version, created.name);
    println!("   {}", created.up_path.display());
    println!("   {}", created.down_path.display());
    if let Some(dependency) = created.depends_on {
        println!("   depends on {}", dependency);
    }
    Ok(())
}

pub async fn up(engine: &MigrationEngine, options: UpOptions) -> anyhow::Result<()> {
    let report = engine.up(options).await?;
    print_apply_report(&report);

    match report.failed {
        Some(failed) => Err(anyhow!(failed.error).context(format!(
            "migration {} ({}) failed after {} applied",
            failed.version,
            failed.name,
            report.applied.len()
        ))),
        None => Ok(()),
    }
}

fn print_apply_report(report: &ApplyReport) {
    if report.is_noop() {
        println!("✅ Schema is up to date");
        return;
    }

    if report.dry_run {
        println!("🔍 Dry run: {} migration(s) would be applied", report.planned.len());
        println!();
        for plan in &report.planned {
            print_plan(plan);
        }
        return;
    }

    for version in &report.applied {
        let name = plan_name(&report.planned, *version);
        println!("✅ Applied {} ({})", version, name);
    }
    if let Some(failed) = &report.failed {
        println!("❌ Failed {} ({}): {}", failed.version, failed.name, failed.error);
        let skipped = report.planned.len() - report.applied.len() - 1;
        if skipped > 0 {
            println!("   {} later migration(s) not attempted", skipped);
        }
    }
}

/// Resolve the mutually exclusive `--steps`, `--target` and `--only` flags
pub fn down_target(steps: Option<usize>, target: Option<Version>, only: Option<Version>) -> DownTarget {
    match (only, target) {
        (Some(version), _) => DownTarget::Only(version),
        (None, Some(version)) => DownTarget::To(version),
        (None, None) => DownTarget::Steps(steps.unwrap_or(1)),
    }
}

pub async fn down(engine: &MigrationEngine, options: DownOptions) -> anyhow::Result<()> {
    let report = engine.down(options).await?;
    print_rollback_report(&report);

    match report.failed {
        Some(failed) => Err(anyhow!(failed.error).context(format!(
            "rollback of {} ({}) failed after {} reverted",
            failed.version,
            failed.name,
            report.reverted.len()
        ))),
        None => Ok(()),
    }
}

fn print_rollback_report(report: &RollbackReport) {
    if report.is_noop() {
        println!("✅ Nothing to roll back");
        return;
    }

    if report.dry_run {
        println!("🔍 Dry run: {} migration(s) would be rolled back", report.planned.len());
        println!();
        for plan in &report.planned {
            print_plan(plan);
        }
        return;
    }

    for version in &report.reverted {
        println!("↩️  Rolled back {} ({})", version, plan_name(&report.planned, *version));
    }
    if let Some(failed) = &report.failed {
        println!("❌ Failed {} ({}): {}", failed.version, failed.name, failed.error);
    }
}

fn plan_name(plans: &[MigrationPlan], version: Version) -> &str {
    plans
        .iter()
        .find(|p| p.version == version)
        .map(|p| p.name.as_str())
        .unwrap_or("?")
}

fn print_plan(plan: &MigrationPlan) {
    println!("{} {} [{}]", plan.version, plan.name, plan.direction);
    println!("   depends on: {}", join_versions(&plan.depends_on));
    println!("   checksum:   {}", short_checksum(&plan.checksum, 16));
    println!("   lines:      {}", plan.total_lines);
    if !plan.sql_preview.is_empty() {
        println!("{}", indent(&plan.sql_preview, "   | "));
        if plan.total_lines > plan.sql_preview.lines().count() {
            println!("   | ...");
        }
    }
    println!();
}

pub async fn status(engine: &MigrationEngine, json: bool) -> anyhow::Result<()> {
    let report = engine.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&report);
    }
    Ok(())
}

fn print_status(report: &MigrationStatusReport) {
    println!("Migration Status");
    println!("================");
    match report.current_version {
        Some(version) => println!("Current version: {}", version),
        None => println!("Current version: none"),
    }
    println!("Applied: {}", report.applied.len());
    println!("Pending: {}", report.pending.len());

    if !report.applied.is_empty() {
        println!();
        for applied in &report.applied {
            let marker = match applied.checksum_valid {
                Some(true) => "✅",
                Some(false) => "⚠️ ",
                None => "❓",
            };
            println!(
                "  {} {} {} ({})",
                marker,
                applied.entry.version,
                applied.entry.name,
                applied.entry.applied_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    if !report.pending.is_empty() {
        println!();
        for pending in &report.pending {
            let state = if pending.is_complete { "Ready" } else { "Incomplete" };
            println!("  ⏳ {} {} [{}]", pending.version, pending.name, state);
        }
    }
}

pub async fn deps(engine: &MigrationEngine, json: bool) -> anyhow::Result<()> {
    let report = engine.deps().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_deps(&report);
    }
    Ok(())
}

fn print_deps(report: &DependencyReport) {
    if report.nodes.is_empty() {
        println!("No migrations found");
        return;
    }

    let name_width = report
        .nodes
        .iter()
        .map(|n| n.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<20} {:<name_width$} {:<8} {:<30} {}",
        "VERSION", "NAME", "APPLIED", "DEPENDS ON", "REQUIRED BY"
    );
    for node in &report.nodes {
        println!(
            "{:<20} {:<name_width$} {:<8} {:<30} {}",
            node.version.to_string(),
            node.name,
            if node.applied { "yes" } else { "no" },
            join_versions(&node.depends_on),
            join_versions(&node.dependents)
        );
    }

    for cycle in &report.cycles {
        let chain = cycle.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" -> ");
        println!();
        println!("⚠️  Circular dependency detected: {}", chain);
    }
}

pub async fn verify(engine: &MigrationEngine, json: bool) -> anyhow::Result<()> {
    let report = engine.verify().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_verify(&report);
    }

    if !report.is_valid() {
        bail!(
            "{} applied migration(s) no longer match their files",
            report.mismatches().count()
        );
    }
    Ok(())
}

fn print_verify(report: &VerifyReport) {
    for entry in &report.entries {
        match &entry.outcome {
            VerifyOutcome::Valid => println!("  ✅ {} {}", entry.version, entry.name),
            VerifyOutcome::Mismatch { stored, computed } => {
                println!("  ❌ {} {}: CHECKSUM MISMATCH", entry.version, entry.name);
                println!("     stored:   {}", stored);
                println!("     computed: {}", computed);
            }
            VerifyOutcome::MissingOnDisk => {
                println!("  ❓ {} {}: not found on disk", entry.version, entry.name)
            }
        }
    }

    println!();
    if report.is_valid() {
        println!("✅ All checksums valid ({} checked)", report.entries.len());
    } else {
        println!("❌ Checksums invalid ({} modified)", report.mismatches().count());
    }
}
