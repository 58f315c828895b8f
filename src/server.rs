//! HTTP RPC surface
//!
//! Exposes the two remote operations over HTTP/JSON using axum:
//!
//! - `POST /status` - catalog summary for a named database
//! - `POST /query`  - content-based search, mirroring the CLI query surface
//!
//! Each request opens the named database, runs to completion, and releases
//! the mapping. The query feature (and times/key-list) paths are resolved on
//! the server's filesystem, so client and server are expected to share one.

use std::net::SocketAddr;
use std::path::Path;

use axum::{http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::format::read_list;
use crate::query::{self, QueryOpts, QueryType};
use crate::store::Database;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRequest {
    /// Database path on the server's filesystem.
    pub database: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub num_files: u32,
    pub dim: u32,
    pub total_vectors: usize,
    pub total_bytes: u32,
    pub flags: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub database: String,
    /// Query feature-file path on the server's filesystem.
    pub features: String,
    #[serde(default = "default_query_type")]
    pub query_type: String,
    pub key_list: Option<String>,
    pub times: Option<String>,
    #[serde(default)]
    pub qpoint: u32,
    #[serde(default = "default_nn")]
    pub point_nn: u32,
    #[serde(default = "default_nn")]
    pub seg_nn: u32,
    #[serde(default = "default_seq_len")]
    pub seq_len: u32,
}

fn default_query_type() -> String {
    "point".to_string()
}

fn default_nn() -> u32 {
    10
}

fn default_seq_len() -> u32 {
    16
}

/// Ranked results as four equal-length parallel lists.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub rlist: Vec<String>,
    pub dist: Vec<f64>,
    pub qpos: Vec<u32>,
    pub spos: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// POST /status
async fn status(Json(request): Json<StatusRequest>) -> impl IntoResponse {
    let db = match Database::open(&request.database) {
        Ok(db) => db,
        Err(err) => return error_response(StatusCode::NOT_FOUND, err),
    };
    let status = db.status(16);

    (
        StatusCode::OK,
        Json(StatusResponse {
            num_files: status.num_files,
            dim: status.dim,
            total_vectors: status.total_vectors,
            total_bytes: status.total_bytes,
            flags: status.flags,
        }),
    )
        .into_response()
}

/// POST /query
async fn run_query(Json(request): Json<QueryRequest>) -> impl IntoResponse {
    let query_type: QueryType = match request.query_type.parse() {
        Ok(qt) => qt,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };

    let db = match Database::open(&request.database) {
        Ok(db) => db,
        Err(err) => return error_response(StatusCode::NOT_FOUND, err),
    };

    let key_list = match &request.key_list {
        Some(path) if !path.is_empty() => match read_list(path) {
            Ok(keys) => Some(keys),
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
        },
        _ => None,
    };

    let opts = QueryOpts {
        qpoint: Some(request.qpoint as usize),
        point_nn: request.point_nn as usize,
        seg_nn: request.seg_nn as usize,
        seq_len: request.seq_len as usize,
        seq_hop: 1,
    };

    let times = request
        .times
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(Path::new);

    let hits = match query::query(
        &db,
        query_type,
        Path::new(&request.features),
        &opts,
        times,
        key_list.as_deref(),
    ) {
        Ok(hits) => hits,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };

    let mut response = QueryResponse {
        rlist: Vec::with_capacity(hits.len()),
        dist: Vec::with_capacity(hits.len()),
        qpos: Vec::with_capacity(hits.len()),
        spos: Vec::with_capacity(hits.len()),
    };
    for hit in hits {
        response.rlist.push(hit.key);
        response.dist.push(hit.distance);
        response.qpos.push(hit.qpos);
        response.spos.push(hit.spos);
    }

    (StatusCode::OK, Json(response)).into_response()
}

pub fn create_router() -> Router {
    Router::new()
        .route("/status", post(status))
        .route("/query", post(run_query))
}

pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    let router = create_router();

    tracing::info!("starting tremolo-db server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
