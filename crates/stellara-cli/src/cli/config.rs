//! `stlr config`: print the resolved engine configuration.

use anyhow::Result;
use console::style;

use crate::state::AppState;

pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "database_url": state.database_url,
            "engine": state.config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Stellara v{}",
        style("*").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!("  Database: {}", style(&state.database_url).dim());
    println!();
    println!("  {}", style("── config.toml (resolved) ──").dim());
    for line in toml::to_string_pretty(&state.config)?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}
