use actix_web::{web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use crate::config::AppConfig;
use crate::demands::{DemandSubmission, ResultsDownload};
use crate::error::AppError;
use crate::models::{Directory, IndexingStatus};
use crate::pipeline::Pipeline;

#[derive(Serialize, Debug)]
struct WebDirectory {
    id: i64,
    name: String,
    is_visible: bool,
    total_photos: usize,
    indexed_photos: usize,
    indexing_status: IndexingStatus,
    last_indexing_date: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize, Debug)]
struct DemandQuery {
    name: String,
    first_name: String,
    email: String,
    filename: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DemandIds {
    ids: Vec<i64>,
}

async fn get_directories(pipeline: web::Data<Arc<Pipeline>>) -> Result<HttpResponse, AppError> {
    let directories: Vec<Directory> = pipeline.store.list_directories().await?;
    let mut web_directories = Vec::with_capacity(directories.len());
    for directory in directories {
        let progress = pipeline.indexer.progress_of(&directory).await?;
        web_directories.push(WebDirectory {
            id: directory.id,
            name: directory.name,
            is_visible: directory.is_visible,
            total_photos: progress.total_photos,
            indexed_photos: progress.indexed_photos,
            indexing_status: progress.status,
            last_indexing_date: directory.last_indexing_date,
        });
    }
    Ok(HttpResponse::Ok().json(web_directories))
}

async fn start_indexing(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    let directory_id = path.into_inner();
    log::debug!("Indexing requested for directory {}", directory_id);
    pipeline.trigger_index(directory_id).await?;
    Ok(HttpResponse::Accepted().body("Indexing started"))
}

async fn indexing_progress(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    let progress = pipeline.index_progress(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(progress))
}

async fn force_search(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    let directory_id = path.into_inner();
    let (status, message) = match pipeline.trigger_search(directory_id).await {
        Ok(request) => {
            let message = match request {
                crate::search::SearchRequest::Started => "Search started",
                crate::search::SearchRequest::NothingToSearch => "No demand to search",
            };
            (serde_json::to_value(request)?, message.to_string())
        }
        Err(AppError::Conflict(message)) => (serde_json::json!("ERROR"), message),
        Err(e) => return Err(e),
    };
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": status, "message": message })))
}

async fn reset_directory(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    let removed = pipeline.indexer.reset_directory(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "removed_photos": removed })))
}

async fn submit_demand(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
    query: web::Query<DemandQuery>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let query = query.into_inner();
    let demand = pipeline
        .submit_demand(DemandSubmission {
            directory_id: path.into_inner(),
            name: query.name,
            first_name: query.first_name,
            email: query.email,
            filename: query.filename,
            image: body.to_vec(),
        })
        .await?;
    Ok(HttpResponse::Created().json(serde_json::json!({
        "id": demand.id,
        "processing_status": demand.processing_status,
    })))
}

async fn delete_demand(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    let demand_id = path.into_inner();
    if pipeline.demands.delete(demand_id).await? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(AppError::NotFound(format!("demand {}", demand_id)))
    }
}

async fn rerun_encoding(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<i64>,
) -> Result<HttpResponse, AppError> {
    pipeline.demands.rerun_encoding(path.into_inner()).await?;
    Ok(HttpResponse::Accepted().body("Encoding started"))
}

async fn reset_demand_search(
    pipeline: web::Data<Arc<Pipeline>>,
    ids: web::Json<DemandIds>,
) -> Result<HttpResponse, AppError> {
    let reset = pipeline.demands.reset_search(&ids.ids).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "reset": reset })))
}

async fn download(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let response = match pipeline.download_results(path.into_inner()).await? {
        ResultsDownload::NotReady => {
            HttpResponse::Ok().body("Your demand has not been processed yet")
        }
        ResultsDownload::NoMatches => HttpResponse::Ok().body("No photo found for this demand"),
        ResultsDownload::Unavailable => {
            HttpResponse::Gone().body("The photos are no longer available")
        }
        ResultsDownload::Archive { filename, bytes } => HttpResponse::Ok()
            .content_type("application/zip")
            .insert_header((
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", filename),
            ))
            .body(bytes),
    };
    Ok(response)
}

async fn job_status(
    pipeline: web::Data<Arc<Pipeline>>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let results = pipeline.queue.results();
    if let Some(group) = results.restore_group(id).await? {
        return Ok(HttpResponse::Ok().json(group));
    }
    match results.job_state(id).await? {
        Some(state) => Ok(HttpResponse::Ok().json(state)),
        None => Err(AppError::NotFound(format!("job {}", id))),
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/directories").route(web::get().to(get_directories)))
        .service(web::resource("/api/directories/{id}/index").route(web::post().to(start_indexing)))
        .service(web::resource("/api/directories/{id}/progress").route(web::get().to(indexing_progress)))
        .service(web::resource("/api/directories/{id}/search").route(web::post().to(force_search)))
        .service(web::resource("/api/directories/{id}/reset").route(web::post().to(reset_directory)))
        .service(web::resource("/api/directories/{id}/demands").route(web::post().to(submit_demand)))
        .service(web::resource("/api/demands/reset-search").route(web::post().to(reset_demand_search)))
        .service(web::resource("/api/demands/{id}").route(web::delete().to(delete_demand)))
        .service(web::resource("/api/demands/{id}/encode").route(web::post().to(rerun_encoding)))
        .service(web::resource("/api/jobs/{id}").route(web::get().to(job_status)))
        .service(web::resource("/download/{token}").route(web::get().to(download)));
}

pub async fn start_web_server(
    config: Arc<AppConfig>,
    pipeline: Arc<Pipeline>,
) -> std::io::Result<()> {
    let port = config.web_port;
    let pipeline_data = web::Data::new(pipeline);

    log::info!("Starting web server on port: {}", port);

    HttpServer::new(move || {
        App::new()
            .app_data(pipeline_data.clone())
            .app_data(web::PayloadConfig::new(20 * 1024 * 1024))
            .configure(routes)
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}
