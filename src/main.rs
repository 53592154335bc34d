use actix_web::{web, App, HttpServer};
use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use novel_crawler::app_state::AppState;
use novel_crawler::config::Config;
use novel_crawler::crawler::CrawlerService;
use novel_crawler::proxy_manager::ProxyManager;
use novel_crawler::proxy_store::ProxyStore;
use novel_crawler::routes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "novel-crawler", version, about = "Proxy-aware web novel crawling backend")]
struct Opt {
    /// Path to the TOML config file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.toml")]
    config: PathBuf,

    /// Path to the log4rs config file
    #[arg(long, default_value = "log4rs.yml")]
    log_config: PathBuf,
}

fn init_logging(path: &Path) {
    if let Err(e) = log4rs::init_file(path, Default::default()) {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}")))
            .build();
        let fallback = log4rs::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info));
        match fallback {
            Ok(config) => {
                if log4rs::init_config(config).is_ok() {
                    log::warn!("Using console logging, {} not loaded: {}", path.display(), e);
                }
            }
            Err(err) => eprintln!("Failed to configure logging: {}", err),
        }
    }
}

fn invalid_input(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let opt = Opt::parse();
    init_logging(&opt.log_config);

    let cfg = Config::load(&opt.config).map_err(invalid_input)?;

    let store = Arc::new(ProxyStore::open(&cfg.proxy_db_path).map_err(invalid_input)?);
    let manager = Arc::new(ProxyManager::new(store.clone(), cfg.manager_options()).map_err(invalid_input)?);
    let crawler = Arc::new(CrawlerService::new(manager, cfg.crawler_options()).map_err(invalid_input)?);

    log::info!("Proxy store: {}", cfg.proxy_db_path);
    log::info!(
        "Proxy policy: fail threshold {}, cooldown {}ms",
        cfg.proxy.fail_threshold,
        cfg.proxy.cooldown_ms
    );
    log::info!("HTTP timeout: {}s", cfg.http.timeout_secs);

    let data = web::Data::new(AppState::new(crawler));
    let shutdown = data.shutdown.clone();

    let (host, port) = cfg.bind_addr();
    let server = HttpServer::new({
        let data = data.clone();
        move || App::new().app_data(data.clone()).configure(routes::configure)
    })
    .bind((host.as_str(), port))?
    .run();

    log::info!("Listening on {}:{}", host, port);

    let handle = server.handle();
    actix_web::rt::spawn(async move {
        shutdown.notified().await;
        handle.stop(true).await;
    });

    let result = server.await;
    if let Err(e) = store.close() {
        log::error!("Failed to close proxy store: {}", e);
    }
    result
}
