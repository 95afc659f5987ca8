use crate::state::Readiness;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tracing::info;

pub async fn readiness_probe(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(readiness: Readiness) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(readiness)
}

pub async fn serve(port: u16, readiness: Readiness) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_app(readiness)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_liveness_is_always_ok() {
        let app = create_app(Readiness::default());
        assert_eq!(status_of(app, "/health/live").await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let readiness = Readiness::default();
        let app = create_app(readiness.clone());
        assert_eq!(
            status_of(app.clone(), "/health/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        readiness.set_ready(true);
        assert_eq!(status_of(app, "/health/ready").await, StatusCode::NO_CONTENT);
    }
}
