use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use futures::future::{abortable, AbortHandle};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio;

use spyscan_backend::{
    config::settings::Settings,
    middleware::metrics::Metrics,
    routes::{anomalies, flow, health, market, negotiate, volumes},
    services::gateway,
    services::hub::{rest::HubClient, Broadcaster, HUB_NAME},
    services::scan::ScanLoop,
    storage::memory::MemoryStore,
    storage::tables::{TableServiceClient, TableStore},
};

fn init_logging() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
        .init();
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logging();
    println!("Starting spyscan backend…");

    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings: {e}");
        std::process::exit(1);
    });

    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    // --- storage ------------------------------------------------------------
    let store: Arc<dyn TableStore> = if settings.storage_connection_string.is_empty() {
        log::warn!("STORAGE_CONNECTION_STRING empty; using in-memory tables");
        Arc::new(MemoryStore::new())
    } else {
        let client = TableServiceClient::from_connection_string(
            &settings.storage_connection_string,
        )
        .unwrap_or_else(|e| {
            eprintln!("Storage configuration invalid: {e}");
            std::process::exit(1);
        });
        if let Err(e) = client.ensure_tables().await {
            eprintln!("Storage unreachable at startup: {e}");
            std::process::exit(1);
        }
        Arc::new(client)
    };

    // --- broadcast hub ------------------------------------------------------
    let hub_client = if settings.hub_connection_string.is_empty() {
        log::warn!("SIGNALR_CONNECTION_STRING empty; real-time broadcast disabled");
        None
    } else {
        match HubClient::from_connection_string(&settings.hub_connection_string, HUB_NAME) {
            Ok(c) => Some(c),
            Err(e) => {
                eprintln!("Hub configuration invalid: {e}");
                std::process::exit(1);
            }
        }
    };
    let broadcaster = Broadcaster::start(hub_client);

    // --- gateway + scan loop ------------------------------------------------
    let gateway = gateway::connect_from_settings(&settings).unwrap_or_else(|e| {
        eprintln!("Gateway unavailable: {e}");
        std::process::exit(1);
    });
    if let Err(e) = gateway.connect().await {
        eprintln!("Failed to acquire gateway on startup: {e}");
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let scan_abort: AbortHandle;
    {
        let scan = ScanLoop::new(settings.clone(), Arc::clone(&gateway), Arc::clone(&running))
            .unwrap_or_else(|e| {
                eprintln!("Failed to build scan loop: {e}");
                std::process::exit(1);
            });
        let (fut, abort) = abortable(scan.run());
        tokio::spawn(fut); // detach
        scan_abort = abort;
    }

    let port = settings.server_port;
    let settings_data = settings.clone();
    let store_data = store.clone();
    let broadcaster_data = broadcaster.clone();
    let recorder_data = recorder.clone();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Metrics)
            .wrap(Cors::permissive()) // public dashboard
            .app_data(web::Data::new(settings_data.clone()))
            .app_data(web::Data::new(store_data.clone()))
            .app_data(web::Data::new(broadcaster_data.clone()))
            .app_data(web::Data::new(recorder_data.clone()))
            .configure(health::configure)
            .configure(volumes::configure)
            .configure(flow::configure)
            .configure(market::configure)
            .configure(negotiate::configure)
            .configure(anomalies::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    // --- ordered shutdown: stop the loop, then drop the gateway -------------
    running.store(false, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(750)).await;
    scan_abort.abort();
    gateway.disconnect().await;

    server
}
