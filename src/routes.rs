use crate::app_state::AppState;
use crate::error::{CrawlerError, ErrorKind};
use crate::models::{ConfigIssue, ProxyConfig};
use crate::providers::{ProviderId, RankParams};
use actix_web::http::StatusCode;
use actix_web::{delete, get, post, web, HttpResponse, Responder, ResponseError};
use serde_json::json;

impl ResponseError for CrawlerError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Configuration => StatusCode::BAD_REQUEST,
            ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::Network | ErrorKind::Parse => StatusCode::BAD_GATEWAY,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.kind() == ErrorKind::Storage {
            log::error!("{}", self);
        }
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }))
    }
}

fn invalid_proxy(issues: Vec<ConfigIssue>) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({
        "error": "Invalid proxy configuration",
        "issues": issues,
    }))
}

fn storage_failure(e: impl std::fmt::Display) -> HttpResponse {
    log::error!("Proxy store failure: {}", e);
    HttpResponse::InternalServerError().json(json!({"error": e.to_string(), "kind": ErrorKind::Storage}))
}

#[get("/proxies")]
async fn list_proxies(data: web::Data<AppState>) -> impl Responder {
    match data.proxies().list() {
        Ok(proxies) => HttpResponse::Ok().json(proxies),
        Err(e) => storage_failure(e),
    }
}

#[post("/proxies")]
async fn add_proxy(data: web::Data<AppState>, body: web::Json<serde_json::Value>) -> impl Responder {
    let config: ProxyConfig = match serde_json::from_value(body.into_inner()) {
        Ok(config) => config,
        Err(e) => {
            return invalid_proxy(vec![ConfigIssue {
                path: String::new(),
                message: e.to_string(),
            }])
        }
    };
    if let Err(issues) = config.validate() {
        return invalid_proxy(issues);
    }
    match data.proxies().add(&config) {
        Ok(state) => HttpResponse::Created().json(state),
        Err(e) => storage_failure(e),
    }
}

#[delete("/proxies/{id}")]
async fn remove_proxy(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let Ok(id) = path.parse::<i64>() else {
        return HttpResponse::BadRequest().json(json!({"error": "Invalid proxy id"}));
    };
    match data.proxies().remove(id) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => storage_failure(e),
    }
}

#[get("/metrics")]
async fn get_metrics(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.crawler.metrics().get_all_metrics())
}

#[post("/shutdown")]
async fn shutdown(data: web::Data<AppState>) -> impl Responder {
    log::info!("Shutdown requested");
    data.shutdown.notify_one();
    HttpResponse::Accepted().json(json!({"status": "shutting down"}))
}

#[get("/{provider}/metadata/{novel_id}")]
async fn get_metadata(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, CrawlerError> {
    let (provider, novel_id) = path.into_inner();
    let provider: ProviderId = provider.parse()?;
    let metadata = data.crawler.get_metadata(provider, &novel_id).await?;
    Ok(HttpResponse::Ok().json(metadata))
}

#[get("/{provider}/chapter/{novel_id}/{chapter_id}")]
async fn get_chapter(
    data: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> Result<HttpResponse, CrawlerError> {
    let (provider, novel_id, chapter_id) = path.into_inner();
    let provider: ProviderId = provider.parse()?;
    let chapter = data.crawler.get_chapter(provider, &novel_id, &chapter_id).await?;
    Ok(HttpResponse::Ok().json(chapter))
}

#[get("/{provider}/rank")]
async fn get_rank(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<RankParams>,
) -> Result<HttpResponse, CrawlerError> {
    let provider: ProviderId = path.parse()?;
    let page = data.crawler.get_rank(provider, &query).await?;
    Ok(HttpResponse::Ok().json(page))
}

/// Registers every route on an app or test service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_proxies)
        .service(add_proxy)
        .service(remove_proxy)
        .service(get_metrics)
        .service(shutdown)
        .service(get_metadata)
        .service(get_chapter)
        .service(get_rank);
}
