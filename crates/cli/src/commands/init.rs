use pgfast_core::DatabaseConfig;
use std::fs;

/// Create the first migrations and fixtures directories
pub fn run(config: &DatabaseConfig) -> anyhow::Result<()> {
    let dirs = config
        .migrations_dirs
        .iter()
        .take(1)
        .chain(config.fixtures_dirs.iter().take(1));

    for dir in dirs {
        if dir.is_dir() {
            println!("✓ {} already exists", dir.display());
        } else {
            fs::create_dir_all(dir)?;
            println!("✅ Created {}", dir.display());
        }
    }

    println!();
    println!("💡 Next steps:");
    println!("   pgfast schema create create_users");
    println!("   pgfast schema up");
    Ok(())
}
