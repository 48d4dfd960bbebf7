use amm_indexer::ledger::{AggregateRow, TradeRow, VolumeDrift, repair::RepairReport};
use colored::Colorize;
use tabled::{Table, settings::Style};

pub(crate) fn trades(trades: &[TradeRow]) {
    if trades.is_empty() {
        println!("{}", "No trades indexed".yellow());
        return;
    }
    let mut table = Table::new(trades);
    table.with(Style::sharp());
    println!("{table}");
    println!("{}", format!("{} trade(s)", trades.len()).bold());
}

pub(crate) fn markets(aggregates: &[AggregateRow], trade_count: u64) {
    if aggregates.is_empty() {
        println!("{}", "No markets indexed".yellow());
        return;
    }
    let mut table = Table::new(aggregates);
    table.with(Style::sharp());
    println!("{table}");
    println!("{}", format!("{} market(s), {} trade(s)", aggregates.len(), trade_count).bold());
}

pub(crate) fn drifts(drifts: &[VolumeDrift]) {
    if drifts.is_empty() {
        println!("{}", "All market volumes match their trades".green());
        return;
    }
    let rows = drifts.iter().map(|drift| {
        [
            drift.market_id.to_string(),
            drift.stored.clone().unwrap_or_else(|| "-".to_string()).red().to_string(),
            drift.actual.green().to_string(),
        ]
    });
    let mut table = Table::from_iter(
        std::iter::once(["Market".to_string(), "Stored".to_string(), "Actual".to_string()])
            .chain(rows),
    );
    table.with(Style::sharp());
    println!("{table}");
    println!("{}", format!("{} market volume(s) corrected", drifts.len()).bold());
}

pub(crate) fn repair(report: &RepairReport) {
    if report.corrections.is_empty() {
        println!("{}", "No mis-scaled amounts found".green());
    } else {
        let rows = report.corrections.iter().map(|correction| {
            [
                correction.table.to_string(),
                correction.key.to_string(),
                correction.before.red().to_string(),
                correction.after.green().to_string(),
            ]
        });
        let mut table = Table::from_iter(
            std::iter::once([
                "Table".to_string(),
                "Key".to_string(),
                "Before".to_string(),
                "After".to_string(),
            ])
            .chain(rows),
        );
        table.with(Style::sharp());
        println!("{table}");
    }

    println!(
        "{} trade(s) and {} market volume(s) rescaled, {} further volume(s) reconciled, {} \
         cursor(s) rewound",
        report.trades_rescaled(),
        report.aggregates_rescaled(),
        report.drifts.len(),
        report.cursors_rewound,
    );
    if report.committed {
        println!("{}", "Changes committed".green().bold());
    } else {
        println!("{}", "Dry run, nothing was changed; rerun with `--confirm` to apply".yellow().bold());
    }
}
