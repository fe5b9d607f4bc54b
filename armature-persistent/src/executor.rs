//! Request execution with bounded retries, and pipelining.

use http::header::CONNECTION;
use http::{HeaderName, HeaderValue, Method, StatusCode, Version};
use parking_lot::MutexGuard;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::connection::{Connection, Destination};
use crate::error::Diagnostics;
use crate::pool::PersistentPool;
use crate::request::{IntoUrl, Request};
use crate::response::{Response, ResponseHead};
use crate::store::WorkerId;
use crate::wire::Failure;
use crate::{PoolError, Result};

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Whether the connection must be closed after this exchange.
///
/// After `101 Switching Protocols` the stream no longer speaks HTTP/1.1.
fn should_close(request: &Request, response: &Response) -> bool {
    request.wants_close()
        || response.status() == StatusCode::SWITCHING_PROTOCOLS
        || !response.head().is_persistent()
        || response.is_close_delimited()
}

fn into_error(failure: Failure, diagnostics: Diagnostics) -> PoolError {
    match failure {
        Failure::BadResponse(message) => PoolError::BadResponse {
            message,
            diagnostics,
        },
        Failure::Reset(source) => PoolError::Reset {
            source,
            diagnostics,
        },
    }
}

impl PersistentPool {
    /// Send a request to `uri` on the calling thread's connection.
    ///
    /// `None` sends a GET for the path and query of `uri`.
    pub fn request(&self, uri: impl IntoUrl, request: Option<Request>) -> Result<Response> {
        self.execute(WorkerId::current(), uri.into_url()?, request, None)
    }

    /// Like [`PersistentPool::request`], calling `on_head` once the status
    /// line and headers are parsed and before the body is read.
    ///
    /// The worker's store is not locked while `on_head` runs, so the
    /// callback may use the pool, including for the same worker.
    pub fn request_with<F>(
        &self,
        uri: impl IntoUrl,
        request: Option<Request>,
        mut on_head: F,
    ) -> Result<Response>
    where
        F: FnMut(&ResponseHead),
    {
        self.execute(
            WorkerId::current(),
            uri.into_url()?,
            request,
            Some(&mut on_head),
        )
    }

    /// Send a request on behalf of an explicit worker.
    pub fn request_as(
        &self,
        worker: WorkerId,
        uri: impl IntoUrl,
        request: Option<Request>,
    ) -> Result<Response> {
        self.execute(worker, uri.into_url()?, request, None)
    }

    /// Like [`PersistentPool::request_with`] on behalf of an explicit worker.
    pub fn request_with_as<F>(
        &self,
        worker: WorkerId,
        uri: impl IntoUrl,
        request: Option<Request>,
        mut on_head: F,
    ) -> Result<Response>
    where
        F: FnMut(&ResponseHead),
    {
        self.execute(worker, uri.into_url()?, request, Some(&mut on_head))
    }

    /// Merge pool headers into a request and decide if it may be retried.
    fn prepare(&self, url: &Url, request: Option<Request>) -> (Request, bool) {
        let mut request = request.unwrap_or_else(|| Request::for_url(Method::GET, url));
        let settings = self.settings.read();
        let config = &settings.config;

        let headers = request.headers_mut();
        for (name, value) in &config.headers {
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &config.override_headers {
            headers.insert(name.clone(), value.clone());
        }
        if !request.has_connection_header() {
            let headers = request.headers_mut();
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            headers.insert(KEEP_ALIVE, HeaderValue::from(config.keep_alive));
        }

        let retryable = config.retry_change_requests || request.is_idempotent();
        (request, retryable)
    }

    fn execute(
        &self,
        worker: WorkerId,
        url: Url,
        request: Option<Request>,
        mut on_head: Option<&mut dyn FnMut(&ResponseHead)>,
    ) -> Result<Response> {
        let destination = Destination::from_url(&url)?;
        let (request, retryable) = self.prepare(&url, request);
        let options = self.connect_options();

        let store = self.worker_store(worker);
        let mut store = store.lock();
        let mut slot = self.connection_for(&mut store, &destination, &options)?;

        let mut bad_response_retried = false;
        let mut reset_retried = false;

        let outcome = loop {
            store.record_request(slot.key);
            let Some(mut connection) = store.check_out(&slot) else {
                match self.connection_for(&mut store, &destination, &options) {
                    Ok(next) => {
                        slot = next;
                        continue;
                    }
                    Err(e) => break Err(e),
                }
            };

            let result = MutexGuard::unlocked(&mut store, || {
                connection.exchange(&request, on_head.as_deref_mut())
            });
            let failure = match result {
                Ok(response) => {
                    if should_close(&request, &response) {
                        connection.finish();
                    }
                    store.check_in(&slot, connection);
                    break Ok(response);
                }
                Err(failure) => {
                    store.check_in(&slot, connection);
                    failure
                }
            };
            let diagnostics = store.diagnostics(slot.key, Instant::now());

            match failure {
                Failure::BadResponse(message) => {
                    if let Some(connection) = store.connection_mut(&slot) {
                        connection.finish();
                    }
                    if bad_response_retried || !retryable {
                        break Err(into_error(Failure::BadResponse(message), diagnostics));
                    }
                    bad_response_retried = true;
                    debug!(
                        pool = %self.name,
                        %worker,
                        connection = slot.key,
                        error = %message,
                        "Bad response, retrying on a fresh connection"
                    );
                    match self.connection_for(&mut store, &destination, &options) {
                        Ok(next) => slot = next,
                        Err(e) => break Err(e),
                    }
                }
                Failure::Reset(source) => {
                    if reset_retried || !retryable {
                        if let Some(connection) = store.connection_mut(&slot) {
                            connection.finish();
                        }
                        break Err(into_error(Failure::Reset(source), diagnostics));
                    }
                    reset_retried = true;
                    debug!(
                        pool = %self.name,
                        %worker,
                        connection = slot.key,
                        error = %source,
                        "Connection reset, retrying"
                    );
                    if let Err(e) = self.reset(&mut store, &slot, &options) {
                        break Err(e);
                    }
                }
            }
        };

        store.touch(slot.key, Instant::now());
        drop(store);

        match outcome {
            Ok(response) => {
                self.remember_version(&destination, response.version());
                Ok(response)
            }
            Err(e) => {
                warn!(pool = %self.name, %worker, url = %url, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    /// Send several requests on one connection, reading responses in order.
    ///
    /// Requests are written back to back once the destination is known to
    /// speak HTTP/1.1. Until then the first request goes alone; HTTP/1.0
    /// destinations get one request at a time. A response that closes the
    /// connection makes the remaining requests go out on a new one. Failures
    /// are not retried.
    pub fn pipeline(&self, uri: impl IntoUrl, requests: Vec<Request>) -> Result<Vec<Response>> {
        self.pipeline_as(WorkerId::current(), uri, requests, |_| {})
    }

    /// Like [`PersistentPool::pipeline`], calling `on_response` for each
    /// response as it arrives. The worker's store is not locked while
    /// `on_response` runs.
    pub fn pipeline_with<F>(
        &self,
        uri: impl IntoUrl,
        requests: Vec<Request>,
        on_response: F,
    ) -> Result<Vec<Response>>
    where
        F: FnMut(&Response),
    {
        self.pipeline_as(WorkerId::current(), uri, requests, on_response)
    }

    /// Pipeline on behalf of an explicit worker.
    pub fn pipeline_as<F>(
        &self,
        worker: WorkerId,
        uri: impl IntoUrl,
        requests: Vec<Request>,
        mut on_response: F,
    ) -> Result<Vec<Response>>
    where
        F: FnMut(&Response),
    {
        let url = uri.into_url()?;
        let destination = Destination::from_url(&url)?;
        let requests: Vec<Request> = requests
            .into_iter()
            .map(|request| self.prepare(&url, Some(request)).0)
            .collect();
        let options = self.connect_options();

        let store = self.worker_store(worker);
        let mut store = store.lock();
        let mut responses = Vec::with_capacity(requests.len());
        let mut next = 0;

        while next < requests.len() {
            let slot = self.connection_for(&mut store, &destination, &options)?;
            let batch = match self.http_versions.lock().get(&destination.address()) {
                Some(version) if *version >= Version::HTTP_11 => requests.len() - next,
                _ => 1,
            };
            let batch = &requests[next..next + batch];

            for _ in batch {
                store.record_request(slot.key);
            }
            let Some(mut connection) = store.check_out(&slot) else {
                continue;
            };

            let received = responses.len();
            let result = MutexGuard::unlocked(&mut store, || {
                self.send_batch(
                    &mut connection,
                    batch,
                    &destination,
                    &mut on_response,
                    &mut responses,
                )
            });
            next += responses.len() - received;
            if result.is_err() {
                connection.finish();
            }
            store.check_in(&slot, connection);

            if let Err(failure) = result {
                let diagnostics = store.diagnostics(slot.key, Instant::now());
                store.touch(slot.key, Instant::now());
                let error = into_error(failure, diagnostics);
                warn!(pool = %self.name, %worker, url = %url, error = %error, "Pipeline failed");
                return Err(error);
            }
            store.touch(slot.key, Instant::now());
        }

        debug!(pool = %self.name, %worker, count = responses.len(), "Pipeline complete");
        Ok(responses)
    }

    /// Write `batch` back to back, then read its responses in order.
    ///
    /// Stops early once a response closes the connection.
    fn send_batch<F>(
        &self,
        connection: &mut Connection,
        batch: &[Request],
        destination: &Destination,
        on_response: &mut F,
        responses: &mut Vec<Response>,
    ) -> std::result::Result<(), Failure>
    where
        F: FnMut(&Response),
    {
        for request in batch {
            connection.write_request(request)?;
        }
        for request in batch {
            let response = connection.read_response(request.method(), None)?;
            let close = should_close(request, &response);
            self.remember_version(destination, response.version());
            on_response(&response);
            responses.push(response);
            if close {
                connection.finish();
                break;
            }
        }
        Ok(())
    }
}
