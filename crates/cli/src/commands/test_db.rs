use pgfast_core::DatabaseConfig;
use pgfast_testing::TestDatabaseManager;

pub async fn create(config: DatabaseConfig, template: Option<&str>) -> anyhow::Result<()> {
    let manager = TestDatabaseManager::new(config)?;
    let database = manager.create_test_db(template).await?;

    println!("✅ Created {}", database.name());
    println!("   {}", crate::utils::mask_url(database.url()));
    database.pool().close().await;
    Ok(())
}

pub async fn list(config: DatabaseConfig) -> anyhow::Result<()> {
    let manager = TestDatabaseManager::new(config)?;
    let names = manager.list_test_dbs().await?;

    if names.is_empty() {
        println!("No test databases");
    } else {
        for name in &names {
            println!("  {}", name);
        }
        println!("{} test database(s)", names.len());
    }
    Ok(())
}

pub async fn cleanup(config: DatabaseConfig) -> anyhow::Result<()> {
    let manager = TestDatabaseManager::new(config)?;
    let dropped = manager.cleanup_all().await?;

    for name in &dropped {
        println!("🗑️  Dropped {}", name);
    }
    println!("✅ Removed {} test database(s)", dropped.len());
    Ok(())
}
