// HTTP handlers for the query lifecycle endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{FlowError, Result, ValidationMessages};
use crate::identity::QueryId;
use crate::queries::rules::MISSING;
use crate::queries::{self, AGGREGATION_UNITS};
use crate::state::QueryState;

use super::auth::{Action, TokenClaims, GEOGRAPHY_KIND};
use super::stream::{stream_result_as_json, DEFAULT_RESULT_NAME};
use super::ServerContext;

/// `POST /run` — validate, fingerprint, queue, detach execution.
///
/// The body carries `query_kind` beside the query parameters themselves.
/// Identical submissions collapse onto one qid, so the endpoint is
/// idempotent.
pub async fn run_query(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let claims = TokenClaims::from_headers(&headers)?;

    let Some(kind) = body.get("query_kind").and_then(Value::as_str).map(str::to_string) else {
        let mut messages = ValidationMessages::default();
        messages.push("query_kind", MISSING);
        return Err(FlowError::QueryParamsValidation(messages));
    };
    let mut params = body;
    if let Some(object) = params.as_object_mut() {
        object.remove("query_kind");
    }

    let level = params.get("aggregation_unit").and_then(Value::as_str);
    claims.check(&kind, Action::Run, level)?;

    let descriptor = queries::make_descriptor(&kind, &params)?;
    // Location kinds are exposed as their spatial aggregate; the
    // subscriber-level query rides along as the aggregate's dependency.
    let descriptor = if descriptor.supports_aggregation() {
        descriptor.aggregate()?
    } else {
        descriptor
    };
    let qid = descriptor.qid().clone();
    info!(qid = %qid, kind = %kind, "query submitted");

    ctx.coordination
        .set_value(&qid.kind_key(), &kind)
        .await?;
    if !ctx.warehouse.cache_table_exists(&qid).await? {
        ctx.runner.submit(descriptor).await?;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "query_id": qid })),
    ))
}

/// `GET /poll/{qid}` — current state, plus the execution error when ERRORED.
pub async fn poll_query(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(qid): Path<String>,
) -> Result<impl IntoResponse> {
    let claims = TokenClaims::from_headers(&headers)?;
    let qid = QueryId::new(qid);
    let kind = submitted_kind(&ctx, &qid).await?;
    claims.check(&kind, Action::Poll, None)?;

    let machine = ctx.state_machine(&qid);
    let state = machine.current_state().await?;
    let mut body = json!({ "query_id": qid, "state": state });
    if state == QueryState::Errored {
        body["error"] = machine.execution_error().await?.into();
    }
    Ok(Json(body))
}

/// `GET /get_result/{qid}` — stream the materialized rows if EXECUTED, else
/// report the current state with a conflict status.
pub async fn get_result(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(qid): Path<String>,
) -> Result<Response> {
    let claims = TokenClaims::from_headers(&headers)?;
    let qid = QueryId::new(qid);
    let kind = submitted_kind(&ctx, &qid).await?;
    claims.check(&kind, Action::GetResult, None)?;

    let machine = ctx.state_machine(&qid);
    let state = machine.current_state().await?;
    if state != QueryState::Executed {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "query_id": qid, "state": state })),
        )
            .into_response());
    }

    let record = ctx
        .warehouse
        .lookup(&qid)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("query {qid} is not in cache")))?;
    ctx.warehouse.touch(&qid).await?;

    let rows = ctx
        .warehouse
        .stream_rows(&format!("SELECT * FROM {}", record.qualified_name()))
        .await?;
    let chunks = stream_result_as_json(
        rows,
        DEFAULT_RESULT_NAME,
        &[("query_id", json!(qid.as_str()))],
    );
    json_stream_response(chunks)
}

/// `GET /geography/{level}` — stream the GeoJSON feature collection for one
/// aggregation level through the same result streamer.
pub async fn geography(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Path(level): Path<String>,
) -> Result<Response> {
    let claims = TokenClaims::from_headers(&headers)?;
    if !AGGREGATION_UNITS.contains(&level.as_str()) {
        return Err(FlowError::NotFound(format!("unknown geography level {level}")));
    }
    claims.check(GEOGRAPHY_KIND, Action::GetResult, Some(&level))?;

    let rows = ctx
        .warehouse
        .stream_rows(&format!("SELECT * FROM geography.{level}"))
        .await?;
    let chunks = stream_result_as_json(rows, "features", &[("type", json!("FeatureCollection"))]);
    json_stream_response(chunks)
}

/// The kind a qid was submitted as; unknown qids were never submitted.
async fn submitted_kind(ctx: &ServerContext, qid: &QueryId) -> Result<String> {
    ctx.coordination
        .get(&qid.kind_key())
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("unknown query {qid}")))
}

fn json_stream_response(chunks: impl futures::Stream<Item = bytes::Bytes> + Send + 'static) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(chunks.map(Ok::<_, Infallible>)))
        .map_err(|e| FlowError::StreamTerminated(e.to_string()))
}
