use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Route, State, get};

use crate::api::ResizeService;
use crate::metrics::MetricsSnapshot;

pub fn generate_system_routes() -> Vec<Route> {
    routes![healthz, metrics]
}

#[get("/healthz")]
pub fn healthz() -> Status {
    Status::Ok
}

#[get("/metrics")]
pub fn metrics(service: &State<ResizeService>) -> Json<MetricsSnapshot> {
    Json(service.counters.snapshot())
}
