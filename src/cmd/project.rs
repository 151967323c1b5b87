//! Project initialization: `ontextract init`.

use anyhow::{Context, Result};

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use ontextract::config::{CONFIG_FILE, DATA_DIR, OntExtractConfig, OntExtractToml};
    use ontextract::orchestration::db::OrchestrationDb;

    let data_dir = project_dir.join(DATA_DIR);
    let was_initialized = data_dir.join(CONFIG_FILE).exists();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        OntExtractToml::default().save(&config_path)?;
    }

    let config = OntExtractConfig::new(project_dir.to_path_buf())?;
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OrchestrationDb::new(&db_path).context("Failed to initialize database")?;

    if was_initialized {
        println!("OntExtract project already initialized at {}", data_dir.display());
        println!("Database verified at {}", db_path.display());
    } else {
        println!("Initialized OntExtract project at {}", data_dir.display());
        println!();
        println!("  {}/", DATA_DIR);
        println!("  ├── {}   # configuration (see `ontextract config show`)", CONFIG_FILE);
        println!("  └── {}", db_path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default());
        println!();
        println!("Next steps:");
        println!("  1. Export the key named by [llm.extraction] api_key_env");
        println!("  2. Run `ontextract serve`");
    }

    Ok(())
}
