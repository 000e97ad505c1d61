//! iPXE binary endpoint.
//!
//! `GET /ipxe/[{mac}/]{binary}`. The MAC segment is optional and unused
//! here; it exists so deployments can correlate fetches with hosts in access
//! logs. GET and HEAD only.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::binary::canonical_name;
use crate::error::AppError;

use super::AppState;

pub async fn handle_binary(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let name = canonical_name(&path);

    let Some(image) = state.binaries.get(name) else {
        state
            .metrics
            .http_requests
            .with_label_values(&["ipxe", "404"])
            .inc();
        return Err(AppError::NotFound(name.to_string()));
    };

    state
        .metrics
        .http_requests
        .with_label_values(&["ipxe", "200"])
        .inc();
    tracing::debug!("serving iPXE binary {name} ({} bytes)", image.len());

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, image.len().to_string()),
        ],
        image,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use crate::backend::MemoryBackend;
    use crate::binary::Binaries;
    use crate::http::testutil::state_with_backend;
    use crate::http::create_router;

    #[tokio::test]
    async fn serves_known_binary() {
        let app = create_router(state_with_backend(MemoryBackend::new()));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ipxe/snp.efi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&body[..], Binaries::master("snp.efi").unwrap());
    }

    #[tokio::test]
    async fn serves_binary_behind_mac_segment() {
        let app = create_router(state_with_backend(MemoryBackend::new()));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ipxe/01:02:03:04:05:06/ipxe.efi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn strips_traceparent_suffix() {
        let app = create_router(state_with_backend(MemoryBackend::new()));
        let uri = "/ipxe/snp.efi-00-23b1e307bb35484f535a1f772c06910e-d887dc3912240434-01";
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_binary_is_404() {
        let app = create_router(state_with_backend(MemoryBackend::new()));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/ipxe/grub.efi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn head_is_allowed_and_post_is_not() {
        let app = create_router(state_with_backend(MemoryBackend::new()));
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::HEAD)
                    .uri("/ipxe/snp.efi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/ipxe/snp.efi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
