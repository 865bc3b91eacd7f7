pub mod handlers;

use std::io::Cursor;
use std::sync::Arc;

use log::{error, warn};
use rocket::figment::Figment;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{Build, Rocket};
use serde_json::json;

use crate::background::pipeline::{PipelineContext, PipelineRun};
use crate::background::pool::WorkerPool;
use crate::common::errors::ResizeError;
use crate::metrics::CounterMetrics;
use crate::models::response::ErrorResponse;

/// Body sent instead of the real message for every 5xx response.
pub const REDACTED_MESSAGE: &str = "Internal Server error";

#[derive(Debug)]
pub struct AppError {
    pub status: Status,
    pub error: anyhow::Error,
}

impl AppError {
    pub fn new(status: Status, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    /// Bad requests map to 400, everything else from a run to 500.
    pub fn from_resize(err: ResizeError) -> Self {
        let status = if err.is_bad_request() {
            Status::BadRequest
        } else {
            Status::InternalServerError
        };
        Self::new(status, err)
    }
}

#[rocket::async_trait]
impl<'r, 'o: 'r> Responder<'r, 'o> for AppError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let message = if self.status.code >= 500 {
            error!(
                "{} {} failed with {}: {:#}",
                req.method(),
                req.uri(),
                self.status,
                self.error
            );
            REDACTED_MESSAGE.to_string()
        } else {
            warn!(
                "{} {} rejected with {}: {:#}",
                req.method(),
                req.uri(),
                self.status,
                self.error
            );
            self.error.to_string()
        };

        let body = json!({ "error": message }).to_string();

        Response::build()
            .status(self.status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

impl<E> From<E> for AppError
where
    anyhow::Error: From<E>,
{
    fn from(err: E) -> Self {
        AppError {
            status: Status::InternalServerError,
            error: anyhow::Error::from(err),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Shared state of the HTTP front end.
pub struct ResizeService {
    pub pool: Arc<WorkerPool<PipelineRun>>,
    pub context: PipelineContext,
    pub counters: Arc<CounterMetrics>,
}

#[catch(404)]
fn not_found(req: &Request<'_>) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: format!("no route for {} {}", req.method(), req.uri()),
    })
}

#[catch(default)]
fn default_catcher(status: Status, req: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    let error = if status.code >= 500 {
        error!("{} {} failed with {}", req.method(), req.uri(), status);
        REDACTED_MESSAGE.to_string()
    } else {
        status.reason_lossy().to_string()
    };
    (status, Json(ErrorResponse { error }))
}

pub fn build_rocket(figment: Figment, service: ResizeService) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(service)
        .mount("/", handlers::resize::generate_resize_routes())
        .mount("/", handlers::system::generate_system_routes())
        .register("/", catchers![not_found, default_catcher])
}
