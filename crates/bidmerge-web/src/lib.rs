//! Thin axum HTTP surface over [`MergePipeline`].

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bidmerge_core::ProfileId;
use bidmerge_sync::{MergeConfig, MergeError, MergePipeline, MergedArtifact};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "bidmerge-web";

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<MergePipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<MergePipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/files/{run_id}", get(list_files_handler))
        .route("/api/download/{run_id}/{filename}", get(download_handler))
        .route("/api/merge-download/{run_id}", get(merge_download_handler))
        .route("/api/ireps-merge-download/{run_id}", get(ireps_merge_download_handler))
        .route("/gem/files/{run_id}/merge", post(merge_workbook_handler))
        .route("/api/delete/{run_id}/{filename}", delete(delete_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<MergePipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving merge api");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = MergeConfig::from_env();
    let port = config.web_port;
    let pipeline = MergePipeline::new(config)?;
    serve(Arc::new(pipeline), port).await
}

/// Maps pipeline failures onto HTTP statuses.
struct ApiError(MergeError);

impl From<MergeError> for ApiError {
    fn from(err: MergeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MergeError::InvalidRunIdentifier(_) | MergeError::InvalidFileName(_) => {
                StatusCode::BAD_REQUEST
            }
            MergeError::NoInputFiles { .. } | MergeError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                success: false,
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug, Serialize)]
struct MergeResponse {
    success: bool,
    merged_file: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    success: bool,
}

fn content_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".csv") {
        "text/csv; charset=utf-8"
    } else if lower.ends_with(".xlsx") {
        XLSX_CONTENT_TYPE
    } else {
        "application/octet-stream"
    }
}

fn attachment(file_name: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type_for(file_name).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

fn artifact_response(artifact: MergedArtifact) -> Response {
    attachment(&artifact.file_name, artifact.bytes)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn list_files_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.pipeline.list_artifacts(&run_id).await?))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((run_id, filename)): AxumPath<(String, String)>,
) -> Result<Response, ApiError> {
    let bytes = state.pipeline.read_file(&run_id, &filename).await?;
    Ok(attachment(&filename, bytes))
}

async fn merge_download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let artifact = state
        .pipeline
        .merge_or_fetch(&run_id, ProfileId::TenderBid)
        .await?;
    Ok(artifact_response(artifact))
}

async fn ireps_merge_download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let artifact = state
        .pipeline
        .merge_or_fetch(&run_id, ProfileId::EprocTender)
        .await?;
    Ok(artifact_response(artifact))
}

async fn merge_workbook_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<MergeResponse>, ApiError> {
    let artifact = state.pipeline.merge_workbook(&run_id).await?;
    Ok(Json(MergeResponse {
        success: true,
        url: format!("/api/download/{}/{}", artifact.run_id, artifact.file_name),
        merged_file: artifact.file_name,
    }))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((run_id, filename)): AxumPath<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.pipeline.delete_file(&run_id, &filename).await?;
    Ok(Json(DeleteResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tower::ServiceExt;

    fn test_app(root: &Path) -> Router {
        let pipeline = MergePipeline::new(MergeConfig::with_outputs_dir(root)).unwrap();
        app(AppState::new(Arc::new(pipeline)))
    }

    fn seed_run(root: &Path, run_id: &str) {
        let dir = root.join(run_id);
        std::fs::create_dir_all(&dir).unwrap();
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Bid No").unwrap();
        sheet.write_string(0, 1, "Tender No").unwrap();
        sheet.write_string(1, 0, "GEM/1").unwrap();
        sheet.write_string(1, 1, "X1").unwrap();
        workbook.save(dir.join("page1.xlsx")).unwrap();
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let dir = tempfile::tempdir().unwrap();
        let resp = test_app(dir.path()).oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn merge_download_returns_csv_attachment() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(dir.path(), "r1");
        let resp = test_app(dir.path())
            .oneshot(get_req("/api/merge-download/r1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/csv; charset=utf-8"
        );
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap(),
            "attachment; filename=\"merged_data_r1.csv\""
        );
        let text = body_text(resp).await;
        assert!(text.starts_with("user_name,bid_no,"));
        assert!(text.contains(",GEM/1,"));
    }

    #[tokio::test]
    async fn ireps_download_uses_eproc_profile() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(dir.path(), "r2");
        let resp = test_app(dir.path())
            .oneshot(get_req("/api/ireps-merge-download/r2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert_eq!(
            text,
            "dept_unit,tender_no,tender_title,status,work_area,due_datetime\n,X1,,,,\n"
        );
    }

    #[tokio::test]
    async fn empty_run_and_bad_run_id_map_to_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let empty = app
            .clone()
            .oneshot(get_req("/api/merge-download/nothing-here"))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);
        assert!(body_text(empty).await.contains("\"success\":false"));

        let bad = app
            .oneshot(get_req("/api/files/bad%5Crun"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn workbook_merge_then_list_download_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(dir.path(), "r3");
        let app = test_app(dir.path());

        let merged = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/gem/files/r3/merge")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(merged.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(merged).await).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["merged_file"], "merged_data_r3.xlsx");
        assert_eq!(json["url"], "/api/download/r3/merged_data_r3.xlsx");

        let listed = app.clone().oneshot(get_req("/api/files/r3")).await.unwrap();
        let names: Vec<String> = serde_json::from_str(&body_text(listed).await).unwrap();
        assert_eq!(names, vec!["merged_data_r3.xlsx", "page1.xlsx"]);

        let download = app
            .clone()
            .oneshot(get_req("/api/download/r3/merged_data_r3.xlsx"))
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        assert_eq!(
            download.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            XLSX_CONTENT_TYPE
        );

        let delete_req = || {
            Request::builder()
                .method("DELETE")
                .uri("/api/delete/r3/merged_data_r3.xlsx")
                .body(Body::empty())
                .unwrap()
        };
        let deleted = app.clone().oneshot(delete_req()).await.unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);
        assert_eq!(body_text(deleted).await, "{\"success\":true}");

        let again = app.oneshot(delete_req()).await.unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_download_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let resp = test_app(dir.path())
            .oneshot(get_req("/api/download/r4/missing.csv"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
