//! Admin API for the planq server.

use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use planq_core::{
    Intake, Job, JobId, JobStatus, Payload, PlanqError, QueueManager, QueueStats, RetryEntry,
    SharedBackend, SubmitOutcome,
};

/// Application state shared across handlers.
pub struct AppState {
    pub queue: QueueManager<SharedBackend>,
    pub intake: Intake<SharedBackend>,
}

/// Response for health check.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Queue statistics plus registry totals.
#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub jobs: QueueStats,
    pub lineages: usize,
    pub escalated_lineages: usize,
}

#[derive(Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
}

/// Request body for a submission.
#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub payload: Payload,
    /// Continue an existing lineage instead of starting a new one.
    #[serde(default)]
    pub lineage_id: Option<String>,
}

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub job_id: Option<String>,
    pub message: String,
}

#[derive(Serialize)]
pub struct RegistryResponse {
    pub entries: Vec<RetryEntry>,
    pub total: usize,
}

/// Generic API response.
#[derive(Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

fn error_response(context: &str, e: PlanqError) -> HttpResponse {
    tracing::error!(error = %e, "{}", context);
    HttpResponse::InternalServerError().json(ApiResponse {
        success: false,
        message: format!("{}: {}", context, e),
    })
}

fn not_found(message: String) -> HttpResponse {
    HttpResponse::NotFound().json(ApiResponse {
        success: false,
        message,
    })
}

/// Configure API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/health", web::get().to(health))
            .service(
                web::scope("/api")
                    .route("/stats", web::get().to(stats))
                    .route("/jobs", web::get().to(list_jobs))
                    .route("/jobs", web::post().to(enqueue))
                    .route("/jobs", web::delete().to(clear))
                    .route("/jobs/{id}", web::get().to(get_job))
                    .route("/registry", web::get().to(list_registry))
                    .route("/registry/{lineage_id}", web::get().to(get_lineage)),
            ),
    );
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}

async fn stats(state: web::Data<AppState>) -> HttpResponse {
    let jobs = match state.queue.stats().await {
        Ok(stats) => stats,
        Err(e) => return error_response("Failed to read stats", e),
    };
    let entries = match state.queue.registry_entries().await {
        Ok(entries) => entries,
        Err(e) => return error_response("Failed to read registry", e),
    };

    HttpResponse::Ok().json(StatsResponse {
        jobs,
        lineages: entries.len(),
        escalated_lineages: entries.iter().filter(|e| e.is_escalated()).count(),
    })
}

async fn list_jobs(state: web::Data<AppState>, query: web::Query<JobsQuery>) -> HttpResponse {
    let result = match query.status.as_deref() {
        Some(status) => match status.parse::<JobStatus>() {
            Ok(status) => state.queue.query_by_status(status).await,
            Err(_) => {
                return HttpResponse::BadRequest().json(ApiResponse {
                    success: false,
                    message: format!("Unknown status: {}", status),
                })
            }
        },
        None => state.queue.all_jobs().await,
    };

    match result {
        Ok(jobs) => {
            let total = jobs.len();
            HttpResponse::Ok().json(JobsResponse { jobs, total })
        }
        Err(e) => error_response("Failed to list jobs", e),
    }
}

async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let Ok(job_id) = id.parse::<JobId>() else {
        return not_found(format!("Job {} not found", id));
    };

    match state.queue.get(&job_id).await {
        Ok(Some(job)) => HttpResponse::Ok().json(job),
        Ok(None) => not_found(format!("Job {} not found", id)),
        Err(e) => error_response("Failed to fetch job", e),
    }
}

async fn enqueue(state: web::Data<AppState>, body: web::Json<EnqueueRequest>) -> HttpResponse {
    let request = body.into_inner();

    match state
        .intake
        .submit(request.payload, request.lineage_id.as_deref())
        .await
    {
        Ok(SubmitOutcome::Enqueued(job_id)) => HttpResponse::Created().json(EnqueueResponse {
            success: true,
            job_id: Some(job_id.to_string()),
            message: "Job enqueued".to_string(),
        }),
        Ok(SubmitOutcome::DuplicateEscalated) => HttpResponse::Conflict().json(EnqueueResponse {
            success: false,
            job_id: None,
            message: "Lineage already escalated; submission not queued".to_string(),
        }),
        Err(e) => error_response("Failed to enqueue job", e),
    }
}

async fn clear(state: web::Data<AppState>) -> HttpResponse {
    match state.queue.clear().await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse {
            success: true,
            message: "Queue cleared".to_string(),
        }),
        Err(e) => error_response("Failed to clear queue", e),
    }
}

async fn list_registry(state: web::Data<AppState>) -> HttpResponse {
    match state.queue.registry_entries().await {
        Ok(entries) => {
            let total = entries.len();
            HttpResponse::Ok().json(RegistryResponse { entries, total })
        }
        Err(e) => error_response("Failed to list registry", e),
    }
}

async fn get_lineage(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let lineage_id = path.into_inner();
    match state.queue.lineage(&lineage_id).await {
        Ok(Some(entry)) => HttpResponse::Ok().json(entry),
        Ok(None) => not_found(format!("Lineage {} not found", lineage_id)),
        Err(e) => error_response("Failed to fetch lineage", e),
    }
}
