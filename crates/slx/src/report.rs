//! 📊 The end-of-run summary: one row per channel, one for the grand total.
//! A table so comfy it has lumbar support.

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::oplog::{ChannelTally, OpLogSnapshot};

const HEADER: [&str; 8] = [
    "channel",
    "batches",
    "records",
    "dropped",
    "attempts",
    "acked",
    "backed up",
    "backup failures",
];

fn row(label: &str, tally: &ChannelTally) -> Vec<Cell> {
    let numbers = [
        tally.batches_flushed,
        tally.records_flushed,
        tally.records_dropped,
        tally.delivery_attempts,
        tally.batches_acked,
        tally.batches_backed_up,
        tally.backup_failures,
    ];
    std::iter::once(Cell::new(label))
        .chain(
            numbers
                .into_iter()
                .map(|n| Cell::new(n).set_alignment(CellAlignment::Right)),
        )
        .collect()
}

/// 🍽️ Render the snapshot as a table. The last row is always the total.
pub fn summary_table(snapshot: &OpLogSnapshot) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(HEADER);
    for (channel, tally) in &snapshot.per_channel {
        table.add_row(row(channel.as_str(), tally));
    }
    table.add_row(row("total", &snapshot.totals));
    table
}
