//! Reconciles every file in a directory.
//!
//! - `*.csv` files are movement ledgers (`;` or `,` delimited, detected from
//!   the header line).
//! - `*.txt` files are inventory text dumps. The file name must start with
//!   the snapshot it holds: `initial_2024.txt`, `physical.txt`,
//!   `accounting-dec.txt`, `final.txt`.
//! - An optional `reconcile.toml` overrides the default configuration.
//!
//! ```text
//! cargo run --example reconcile_directory -- ./audit/2024 [--csv report.csv]
//! ```

use anyhow::{bail, Context};
use std::fs;
use std::path::{Path, PathBuf};
use stock_reconciler::*;

const DEFAULT_CONFIG: &str = r#"
[movements]
sale_codes = ["5101", "5102", "6101", "6102", "5405", "6405"]
purchase_codes = ["1101", "1102", "2101", "2102"]
"#;

fn detect_delimiter(path: &Path) -> anyhow::Result<u8> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let header = text.lines().next().unwrap_or_default();
    Ok(if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    })
}

fn snapshot_tag(path: &Path) -> anyhow::Result<SourceTag> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let prefix = stem.split(['_', '-', '.']).next().unwrap_or_default();
    prefix
        .parse::<SourceTag>()
        .with_context(|| format!("cannot tell which snapshot {} holds", path.display()))
}

fn load_inputs(dir: &Path) -> anyhow::Result<ReconciliationInputs> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    let mut inputs = ReconciliationInputs::new();
    for path in entries {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => {
                let delimiter = detect_delimiter(&path)?;
                let file = fs::File::open(&path)?;
                inputs = inputs.movement(MovementSource::from_csv_reader(name, file, delimiter)?);
            }
            Some("txt") => {
                let tag = snapshot_tag(&path)?;
                let text = fs::read_to_string(&path)?;
                inputs = inputs.document(InventoryDocument::new(name, tag, text));
            }
            _ => {}
        }
    }
    Ok(inputs)
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(dir) = args.next().map(PathBuf::from) else {
        bail!("usage: reconcile_directory <dir> [--csv <out.csv>]");
    };
    let csv_out = match (args.next().as_deref(), args.next()) {
        (Some("--csv"), Some(path)) => Some(PathBuf::from(path)),
        (None, _) => None,
        _ => bail!("usage: reconcile_directory <dir> [--csv <out.csv>]"),
    };

    let config_path = dir.join("reconcile.toml");
    let config = if config_path.exists() {
        ReconciliationConfig::from_toml(&fs::read_to_string(&config_path)?)?
    } else {
        ReconciliationConfig::from_toml(DEFAULT_CONFIG)?
    };

    let run = run_reconciliation(config, load_inputs(&dir)?)?;
    let report = &run.report;

    println!("Reconciliation generated at {}", run.generated_at.to_rfc3339());
    for source in &run.sources {
        println!(
            "  {}: {} rows, {} sales, {} purchases, {} skipped",
            source.source_name,
            source.rows_read,
            source.sale_rows,
            source.purchase_rows,
            source.skipped_rows
        );
    }
    println!();
    println!(
        "{:<9} {:<32} {:>10} {:>10} {:>10} {:>10}",
        "SEVERITY", "PRODUCT", "SOLD", "EXPECTED", "ACTUAL", "DIFF"
    );
    for r in &report.results {
        println!(
            "{:<9} {:<32} {:>10} {:>10} {:>10} {:>10}{}",
            r.severity.as_str(),
            r.display_name.chars().take(32).collect::<String>(),
            format_quantity(r.quantity_sold),
            format_quantity(r.stock_expected),
            r.stock_final.map(format_quantity).unwrap_or_else(|| "-".into()),
            format_quantity(r.discrepancy),
            if r.divergent_sources { "  *" } else { "" }
        );
    }
    println!();
    println!(
        "{} critical ({}%), {} alert, {} ok, {} with divergent sources",
        report.counts.critical,
        report.percentage_critical,
        report.counts.alert,
        report.counts.ok,
        report.divergent_count
    );

    for diagnostic in &run.diagnostics {
        eprintln!("warning: {}", diagnostic);
    }

    if let Some(path) = csv_out {
        let file = fs::File::create(&path)?;
        report.to_csv(file)?;
        println!("Report written to {}", path.display());
    }

    Ok(())
}
