use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use service_monitoring::{
    api::{self, AppState},
    checks::{failing, CheckEngine},
    collector::{Collector, PassWindow},
    config::{MonitoringConfig, Role},
    handlers::{HandlerTable, HttpRecordSource},
    logging,
    store::MonitoringStore,
    Result,
};
use tracing::{error, info, warn};

const SOURCE_TIMEOUT: StdDuration = StdDuration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = match MonitoringConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = logging::init_logger(config.role) {
        eprintln!("{}", e);
        std::process::exit(2);
    }

    match run(config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every step of the selected role succeeded.
async fn run(config: MonitoringConfig) -> Result<bool> {
    let store = MonitoringStore::open(config.db_path.as_deref())?;
    config.sync(&store).await?;

    match config.role {
        Role::List => list(&store).await,
        Role::Collect => collect(&config, store).await,
        Role::Serve => {
            let checks = CheckEngine::new(store.clone(), config.default_interval);
            api::serve(AppState::new(store, checks), config.port).await?;
            Ok(true)
        }
    }
}

async fn list(store: &MonitoringStore) -> Result<bool> {
    for service in store.list_services().await? {
        let last_checked = service
            .last_checked
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}\t{}\t{}\tevery {}s\tlast checked {}",
            service.name,
            service.service_type.as_str(),
            if service.active { "active" } else { "inactive" },
            service.check_interval.num_seconds(),
            last_checked
        );
    }
    Ok(true)
}

async fn collect(config: &MonitoringConfig, store: MonitoringStore) -> Result<bool> {
    let services: Vec<_> = match &config.service {
        Some(name) => vec![store.get_service(name).await?],
        None => store
            .list_services()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect(),
    };
    if services.is_empty() {
        warn!("No active services to collect");
    }

    let source = HttpRecordSource::new(SOURCE_TIMEOUT, None)?;
    let collector = Collector::new(store.clone(), HandlerTable::new(Arc::new(source)));
    let now = Utc::now();

    let window = PassWindow {
        since: config.since,
        until: config.until,
        force: config.force,
    };
    let runs = collector.run_all(&services, window, now).await;
    let mut succeeded = true;
    for run in &runs {
        match &run.result {
            Ok(outcome) => info!("{}: {} stored, {} skipped", run.service, outcome.stored, outcome.skipped),
            Err(e) => {
                error!("{}: {}", run.service, e);
                succeeded = false;
            }
        }
    }

    if config.clear {
        collector.clear_old_data(now, config.retention).await?;
    }

    let checks = CheckEngine::new(store, config.default_interval);
    let reports = checks.check_for(now).await?;
    for report in failing(&reports) {
        warn!("Notification check {} is {:?}", report.name, report.state);
    }

    if !succeeded {
        error!("One or more collection passes failed");
    }
    Ok(succeeded)
}
