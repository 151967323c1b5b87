//! HTTP service command: `ontextract serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;

pub async fn cmd_serve(
    project_dir: &Path,
    verbose: bool,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    use ontextract::config::OntExtractConfig;
    use ontextract::logging::init_logging;
    use ontextract::orchestration::server::{ServerConfig, start_server};

    let mut config = OntExtractConfig::with_cli_args(project_dir.to_path_buf(), verbose)?;
    if let Some(port) = port {
        config.toml.server.port = port;
    }
    if let Some(path) = db_path {
        config.toml.server.db_path = Some(path);
    }

    let _log_guard = init_logging(
        &config.toml.logging,
        config.log_dir().as_deref(),
        config.verbose,
    )?;

    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }

    let mut server = ServerConfig::from_config(&config);
    server.dev_mode = dev;
    start_server(server).await
}
