//! Read-only HTTP interface over any [`Query`] backend.
//!
//! Every route is a `GET`. Single records are returned as one JSON document.
//! Lists the query layer streams are sent as newline-delimited JSON while
//! they are produced; a failure part-way through ends the body with a final
//! `{"error": ...}` line.
//!
//! | Route                                                   | Answer                               |
//! |---------------------------------------------------------|--------------------------------------|
//! | `/packages`                                             | package names                        |
//! | `/packages/{package}`                                   | default channel and channel heads    |
//! | `/packages/{package}/channels/{channel}/head`           | head bundle                          |
//! | `/packages/{package}/channels/{channel}/bundles/{csv}`  | one bundle                           |
//! | `/packages/{package}/channels/{channel}/replaces/{csv}` | bundle replacing `csv`               |
//! | `/bundles`                                              | every bundle, streamed               |
//! | `/entries/replacing/{csv}`                              | entries replacing `csv`, streamed    |
//! | `/apis/{group}/{version}/{kind}/entries`                | entries providing the API, streamed  |
//! | `/apis/{group}/{version}/{kind}/latest`                 | heads providing the API, streamed    |
//! | `/apis/{group}/{version}/{kind}/bundle`                 | bundle chosen to satisfy the API     |
//!
//! Core APIs have an empty group: `/apis//v1/Pod/latest`.

use crate::error::{ErrorKind, Result};
use async_stream::stream;
use exn::ResultExt;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use opcat_model::Gvk;
use opcat_query::Query;
use opcat_query::error::Result as QueryResult;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type Body = UnsyncBoxBody<Bytes, Infallible>;

const JSON: &str = "application/json";
const NDJSON: &str = "application/x-ndjson";

/// Accept connections until `shutdown` is cancelled.
///
/// Connections already being served are left to finish on their own tasks.
pub async fn serve(query: Arc<dyn Query>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let address = listener.local_addr().or_raise(|| ErrorKind::Serve)?;
    info!(%address, "serving catalog queries");
    let http = ConnBuilder::new(TokioExecutor::new());
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                },
            },
        };
        let (http, query) = (http.clone(), query.clone());
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let query = query.clone();
                async move { Ok::<_, Infallible>(handle(query, request).await) }
            });
            if let Err(err) = http.serve_connection(TokioIo::new(socket), service).await {
                debug!(%peer, error = %err, "connection ended with an error");
            }
        });
    }
    info!("query server stopped");
    Ok(())
}

/// Answer one request.
pub async fn handle<B>(query: Arc<dyn Query>, request: Request<B>) -> Response<Body> {
    let (parts, _) = request.into_parts();
    if parts.method != Method::GET {
        return failure(StatusCode::METHOD_NOT_ALLOWED, format!("{} is not supported", parts.method));
    }
    let path = parts.uri.path();
    debug!(path, "query request");
    let segments: Vec<&str> = path.strip_prefix('/').unwrap_or(path).split('/').collect();
    match segments.as_slice() {
        ["packages"] => respond(query.list_packages().await),
        ["packages", package] => respond(query.get_package(package).await),
        ["packages", package, "channels", channel, "head"] => {
            respond(query.get_bundle_for_channel(package, channel).await)
        },
        ["packages", package, "channels", channel, "bundles", csv] => {
            respond(query.get_bundle(package, channel, csv).await)
        },
        ["packages", package, "channels", channel, "replaces", csv] => {
            respond(query.get_bundle_that_replaces(csv, package, channel).await)
        },
        ["bundles"] => listing(query, Listing::Bundles),
        ["entries", "replacing", csv] => listing(query, Listing::Replacing(csv.to_string())),
        ["apis", group, version, kind, "entries"] => listing(query, Listing::Providing(Gvk::new(*group, *version, *kind))),
        ["apis", group, version, kind, "latest"] => {
            listing(query, Listing::LatestProviding(Gvk::new(*group, *version, *kind)))
        },
        ["apis", group, version, kind, "bundle"] => {
            respond(query.get_bundle_that_provides(&Gvk::new(*group, *version, *kind)).await)
        },
        _ => failure(StatusCode::NOT_FOUND, format!("no route for {path}")),
    }
}

/// A streamed list and the arguments it needs.
enum Listing {
    Bundles,
    Replacing(String),
    Providing(Gvk),
    LatestProviding(Gvk),
}

fn listing(query: Arc<dyn Query>, listing: Listing) -> Response<Body> {
    let frames = stream! {
        let mut lines = match &listing {
            Listing::Bundles => query.list_bundles().map(line).boxed(),
            Listing::Replacing(csv) => query.get_channel_entries_that_replace(csv).map(line).boxed(),
            Listing::Providing(gvk) => query.get_channel_entries_that_provide(gvk).map(line).boxed(),
            Listing::LatestProviding(gvk) => query.get_latest_channel_entries_that_provide(gvk).map(line).boxed(),
        };
        while let Some(next) = lines.next().await {
            let last = next.is_err();
            let bytes = next.unwrap_or_else(|error_line| error_line);
            yield Ok::<_, Infallible>(Frame::data(Bytes::from(bytes)));
            if last {
                break;
            }
        }
    };
    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    response
}

/// One NDJSON line for a streamed record, or the error line ending the stream.
fn line<T: Serialize>(item: QueryResult<T>) -> std::result::Result<Vec<u8>, Vec<u8>> {
    let encoded = match item {
        Ok(value) => serde_json::to_vec(&value).map_err(|err| err.to_string()),
        Err(err) => {
            warn!(error = %*err, "stream failed");
            Err((*err).to_string())
        },
    };
    let (mut bytes, failed) = match encoded {
        Ok(bytes) => (bytes, false),
        Err(message) => (error_body(message), true),
    };
    bytes.push(b'\n');
    if failed { Err(bytes) } else { Ok(bytes) }
}

fn respond<T: Serialize>(result: QueryResult<T>) -> Response<Body> {
    match result {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(bytes) => full(StatusCode::OK, bytes),
            Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        },
        Err(err) if err.is_not_found() => failure(StatusCode::NOT_FOUND, (*err).to_string()),
        Err(err) => {
            warn!(error = ?err, "query failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, (*err).to_string())
        },
    }
}

fn error_body(message: String) -> Vec<u8> {
    serde_json::json!({ "error": message }).to_string().into_bytes()
}

fn failure(status: StatusCode, message: String) -> Response<Body> {
    full(status, error_body(message))
}

fn full(status: StatusCode, bytes: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Full::new(Bytes::from(bytes)).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
    response
}
