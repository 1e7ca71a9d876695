use registry_database::RegistryDatabase;
use registry_service::chain::RegistryContract;
use registry_service::config::Config;
use registry_service::metrics::RegistryMetrics;
use registry_service::reconciler::Reconciler;
use registry_service::update_service::UpdateService;
use slog::{error, info, o, Drain, Logger};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = Logger::root(drain, o!());

    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            error!(logger, "usage: registry-indexer <config.yml>");
            std::process::exit(1);
        }
    };
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(logger, "failed to load config"; "path" => %config_path, "error" => e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!(logger, "invalid config"; "error" => e);
        std::process::exit(1);
    }
    if !config.registry_enabled {
        info!(logger, "registry module disabled, nothing to do");
        return;
    }
    // validate() already proved the address parses
    let module_address = config.module_address().expect("config validated");

    let db = match RegistryDatabase::open_or_create(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            error!(logger, "failed to open database"; "path" => %config.db_path.display(), "error" => %e);
            std::process::exit(1);
        }
    };
    let contract = match RegistryContract::new(&config.rpc_url, module_address) {
        Ok(contract) => contract,
        Err(e) => {
            error!(logger, "failed to connect provider"; "error" => %e);
            std::process::exit(1);
        }
    };

    info!(
        logger,
        "starting registry indexer";
        "module" => %module_address,
        "interval ms" => config.update_interval_ms,
        "mirror" => format!("{:?}", config.mirror),
    );

    let reconciler = Arc::new(Reconciler::new(
        logger.clone(),
        contract,
        db,
        module_address,
        config.mirror,
    ));
    let metrics = Arc::new(RegistryMetrics::new());
    UpdateService::spawn(logger.clone(), &config, reconciler, metrics);

    let _ = tokio::signal::ctrl_c().await;
    info!(logger, "shutting down");
}
