//! Filesystem layout for the running engine, alongside `EngineConfig`'s own
//! `$HOME/.messaging-engine/config.toml`.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// `$HOME/.messaging-engine/data` — holds `engine.sqlite3` and the Job
/// Runtime's queue file.
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".messaging-engine").join("data"))
}
