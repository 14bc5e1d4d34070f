use pgfast_core::DatabaseConfig;
use pgfast_schema::{FixtureLoader, MigrationEngine};
use std::path::PathBuf;

/// Load `paths`, or every fixture under the configured directories when empty
pub async fn load(config: &DatabaseConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let engine = super::engine_for(config).await?;
    let result = load_with(&engine, config, paths).await;
    super::close_after(engine, result).await
}

async fn load_with(engine: &MigrationEngine, config: &DatabaseConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let loader = FixtureLoader::for_engine(engine, config.fixtures_dirs.clone())?;

    let loaded = loader.load(paths).await?;
    if loaded.is_empty() {
        println!("No fixtures found");
        return Ok(());
    }

    for path in &loaded {
        println!("✅ Loaded {}", path.display());
    }
    println!("📦 {} fixture(s) loaded", loaded.len());
    Ok(())
}
