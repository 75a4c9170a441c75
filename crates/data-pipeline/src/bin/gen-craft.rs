//! Flatten `craft_table.json` into `generated/craft.json`.

fn main() -> anyhow::Result<()> {
    data_pipeline::run_generator(tracker_core::ExchangeKind::Craft)
}
