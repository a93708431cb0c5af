use tally_db::{MigrationReport, SchemaStatus};

pub fn print_migration(label: &str, report: &MigrationReport) {
    if report.applied.is_empty() {
        println!("{label}: up to date at version {}", report.current_version);
        return;
    }
    let applied: Vec<String> = report.applied.iter().map(u32::to_string).collect();
    println!(
        "{label}: migrated {} -> {} (applied {})",
        report.starting_version,
        report.current_version,
        applied.join(", ")
    );
}

pub fn print_status(label: &str, status: &SchemaStatus) {
    println!("{label}: current version {}", status.current_version);
    for entry in &status.entries {
        println!(
            "  applied  {:>4}  {}",
            entry.version,
            entry.applied_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    for version in &status.pending {
        println!("  pending  {version:>4}");
    }
    if status.is_up_to_date() {
        println!("  up to date");
    }
    if !status.unknown.is_empty() {
        println!("  unknown to this build: {:?}", status.unknown);
    }
    if !status.skipped.is_empty() {
        println!("  below current version, never applied: {:?}", status.skipped);
    }
}
