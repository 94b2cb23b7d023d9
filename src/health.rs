use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn healthz(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "model": state.config().whisper.model
    }))
}

pub async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.metrics_snapshot();
    let config = state.config();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in snapshot.endpoints.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "average_duration_ms": metric.average_duration_ms()
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": "whisper-gateway",
            "version": env!("CARGO_PKG_VERSION")
        },
        "overall": {
            "total_requests": snapshot.request_count,
            "total_errors": snapshot.error_count,
            "error_rate": if snapshot.request_count > 0 {
                snapshot.error_count as f64 / snapshot.request_count as f64
            } else {
                0.0
            },
            "in_flight_transcriptions": snapshot.in_flight_transcriptions
        },
        "endpoints": endpoint_stats,
        "model": {
            "model": config.whisper.model,
            "compute_type": config.whisper.compute_type,
            "device": config.whisper.device,
            "initialized": state.provider().initialized().await
        }
    }))
}
