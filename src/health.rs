use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let broadcast = match state.coordinator.current().await {
        Ok(session) => json!({
            "status": session.status.as_str(),
            "store": "ok"
        }),
        Err(e) => json!({
            "status": "unknown",
            "store": e.to_string()
        }),
    };
    let healthy = broadcast["store"] == "ok";

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "broadcast": broadcast,
        "listeners": state.broadcaster.listener_count(),
        "conversion_queue_depth": state.conversions.queue_depth(),
        "memory": get_memory_info()
    });

    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let broadcast_status = state
        .coordinator
        .current()
        .await
        .map(|s| s.status.as_str())
        .unwrap_or("unknown");

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "broadcast": {
            "status": broadcast_status,
            "listeners": state.broadcaster.listener_count()
        },
        "conversion": {
            "queue_depth": state.conversions.queue_depth()
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestApp;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_broadcast_and_queue() {
        let app = TestApp::new();
        let _listener = app.state.coordinator.subscribe().await.unwrap();
        let service = test::init_service(
            App::new()
                .app_data(web::Data::new(app.state.clone()))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&service, test::TestRequest::get().uri("/health").to_request())
                .await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["broadcast"]["status"], "offline");
        assert_eq!(body["listeners"], 1);
        assert_eq!(body["conversion_queue_depth"], 0);

        let body: serde_json::Value =
            test::call_and_read_body_json(&service, test::TestRequest::get().uri("/metrics").to_request())
                .await;
        assert_eq!(body["broadcast"]["listeners"], 1);
        assert_eq!(body["conversion"]["queue_depth"], 0);
    }
}
