use schemars::schema_for;

use crate::config::Config;
use crate::record::OwnershipRecord;

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum SchemaTarget {
    /// The shared ownership record
    #[default]
    Record,
    /// handshake.toml
    Config,
}

/// Print the JSON Schema for the ownership record or the config file to stdout.
pub fn run_schema(target: SchemaTarget) -> anyhow::Result<()> {
    let schema = match target {
        SchemaTarget::Record => schema_for!(OwnershipRecord),
        SchemaTarget::Config => schema_for!(Config),
    };
    let json = serde_json::to_string_pretty(&schema)?;
    println!("{json}");
    Ok(())
}
