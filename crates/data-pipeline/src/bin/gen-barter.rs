//! Flatten `barter_table.json` into `generated/barter.json`.

fn main() -> anyhow::Result<()> {
    data_pipeline::run_generator(tracker_core::ExchangeKind::Barter)
}
