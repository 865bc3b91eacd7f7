use std::time::Instant;

use anyhow::anyhow;
use log::debug;
use rocket::http::{ContentType, Status};
use rocket::serde::json::{self, Json};
use rocket::{Route, State, post};

use crate::api::{AppError, AppResult, ResizeService};
use crate::background::pipeline::PipelineRun;
use crate::background::pool::Job;
use crate::common::errors::ResizeError;
use crate::models::request::ResizeRequest;
use crate::models::response::ResizeResponse;

pub fn generate_resize_routes() -> Vec<Route> {
    routes![resize]
}

#[post("/resize", data = "<body>")]
pub async fn resize(
    service: &State<ResizeService>,
    content_type: Option<&ContentType>,
    body: Result<Json<ResizeRequest>, json::Error<'_>>,
) -> AppResult<Json<ResizeResponse>> {
    let metrics = &service.context.metrics;
    metrics.request_received();
    let outcome = handle_resize(service, content_type, body).await;
    if outcome.is_err() {
        metrics.request_failed();
    }
    outcome
}

async fn handle_resize(
    service: &ResizeService,
    content_type: Option<&ContentType>,
    body: Result<Json<ResizeRequest>, json::Error<'_>>,
) -> AppResult<Json<ResizeResponse>> {
    if !content_type.is_some_and(|ct| ct.is_json()) {
        return Err(AppError::new(
            Status::UnsupportedMediaType,
            anyhow!("content type must be application/json"),
        ));
    }
    let Json(request) = body.map_err(|err| {
        AppError::new(
            Status::BadRequest,
            anyhow!("error unmarshal request: {}", err),
        )
    })?;
    let plan = request.validate().map_err(|err| {
        AppError::new(Status::BadRequest, anyhow!("validation error: {}", err))
    })?;
    debug!(
        "Accepted {} with {} sizes",
        plan.original_path,
        plan.sizes.len()
    );

    let run = PipelineRun::new(plan, service.context.clone());
    let rollback = run.rollback();
    let (job, reply) = Job::new(run);

    let metrics = &service.context.metrics;
    let start_time = Instant::now();
    metrics.queue_enter();
    service.pool.dispatch(job).await;
    let result = match reply.await {
        Ok(Ok(result)) => result,
        Ok(Err(pool_error)) => Err(ResizeError::from(pool_error)),
        Err(_) => Err(ResizeError::Internal("job reply channel closed".to_string())),
    };
    metrics.queue_leave();
    metrics.observe_total(start_time.elapsed());

    match result {
        Ok(sizes) => Ok(Json(ResizeResponse { sizes })),
        Err(err) => {
            // Runs after the response; its outcome is only logged.
            tokio::spawn(rollback.run());
            Err(AppError::from_resize(err))
        }
    }
}
