//! Configuration view and validation commands: `ontextract config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use ontextract::config::{CONFIG_FILE, DATA_DIR, OntExtractConfig, OntExtractToml};

    let data_dir = project_dir.join(DATA_DIR);
    let config_path = data_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("OntExtract Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using defaults. Run 'ontextract config init' to create one.");
            }
            println!();

            // Effective values include ONTEXTRACT_* environment overrides.
            let config = OntExtractConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;

            println!("[server]");
            println!("  host = \"{}\"", toml.server.host);
            println!("  port = {}", toml.server.port);
            println!("  db_path = \"{}\"", config.db_path().display());
            println!();

            println!("[orchestration]");
            println!("  review_policy = \"{}\"", toml.orchestration.review_policy);
            println!(
                "  max_concurrent_documents = {}",
                toml.orchestration.max_concurrent_documents
            );
            println!("  resume_on_startup = {}", toml.orchestration.resume_on_startup);
            println!();

            for (name, llm) in [
                ("extraction", &toml.llm.extraction),
                ("synthesis", &toml.llm.synthesis),
            ] {
                let key_state = if std::env::var(&llm.api_key_env).is_ok() {
                    "set"
                } else {
                    "missing"
                };
                println!("[llm.{}]", name);
                println!("  provider = \"{}\"", llm.provider);
                println!("  model = \"{}\"", llm.model);
                println!("  api_key_env = \"{}\" ({})", llm.api_key_env, key_state);
                if let Some(url) = &llm.base_url {
                    println!("  base_url = \"{}\"", url);
                }
                println!("  max_tokens = {}", llm.max_tokens);
                println!("  temperature = {}", llm.temperature);
                println!("  timeout_secs = {}", llm.timeout_secs);
                println!();
            }

            println!("[tools]");
            println!("  embedding_dimensions = {}", toml.tools.embedding_dimensions);
            println!();

            println!("[logging]");
            println!("  level = \"{}\"", toml.logging.level);
            println!("  format = \"{:?}\"", toml.logging.format);
            if let Some(dir) = config.log_dir() {
                println!("  directory = \"{}\"", dir.display());
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let config = OntExtractConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&data_dir)?;
            OntExtractToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path");
            println!("  - [orchestration] review_policy, max_concurrent_documents");
            println!("  - [llm.extraction] and [llm.synthesis] model, api_key_env");
            println!();
        }
    }

    Ok(())
}
