use prettytable::{Cell, Row, Table};

/// One row of the restore workflow's bundle-selection table.
pub struct BundleRow {
    pub index: usize,
    pub timestamp: String,
    pub encryption: &'static str,
    pub script_version: String,
    pub tier: &'static str,
}

pub fn print_bundle_table(rows: &[BundleRow]) {
    if rows.is_empty() {
        tracing::info!("<no bundles found>");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("#"),
        Cell::new("Created (UTC)"),
        Cell::new("Encryption"),
        Cell::new("Agent"),
        Cell::new("Tier"),
    ]));
    for r in rows {
        table.add_row(Row::new(vec![
            Cell::new(&r.index.to_string()),
            Cell::new(&r.timestamp),
            Cell::new(r.encryption),
            Cell::new(&r.script_version),
            Cell::new(r.tier),
        ]));
    }
    table.printstd();
}

pub fn print_check_results(results: &[crate::preflight::CheckResult]) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![Cell::new("Check"), Cell::new("Status"), Cell::new("Detail")]));
    for r in results {
        table.add_row(Row::new(vec![
            Cell::new(r.name),
            Cell::new(if r.ok { "ok" } else { "FAIL" }),
            Cell::new(&r.detail),
        ]));
    }
    table.printstd();
}
