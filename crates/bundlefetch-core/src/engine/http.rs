//! HTTP(S) transport
//!
//! Each transfer runs as a task on a small tokio runtime owned by the
//! transport and streams the body straight to the save path. With a range
//! start the request carries `Range: bytes=N-` and the body is appended;
//! a server answering such a request with 200 has ignored the range, so the
//! partial file is truncated and the attempt fails.

use crate::dispatch::Dispatcher;
use crate::engine::transport::{
    TransferHandle, TransferOutcome, TransferState, Transport, TransportRequest, WorkerTransfer,
};
use crate::error::{BundleError, BundleResult};
use futures::StreamExt;
use reqwest::{Client, ClientBuilder, RequestBuilder, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Applied to every outgoing request (headers, auth, ...)
pub type RequestHook = Arc<dyn Fn(RequestBuilder) -> RequestBuilder + Send + Sync>;

/// Applied once to the client builder (extra roots, relaxed validation, ...)
pub type CertificateHook = Arc<dyn Fn(ClientBuilder) -> ClientBuilder + Send + Sync>;

pub struct HttpTransportBuilder {
    dispatcher: Dispatcher,
    user_agent: String,
    connect_timeout: Duration,
    request_hook: Option<RequestHook>,
    certificate_hook: Option<CertificateHook>,
    worker_threads: usize,
}

impl HttpTransportBuilder {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_hook(mut self, hook: RequestHook) -> Self {
        self.request_hook = Some(hook);
        self
    }

    pub fn certificate_hook(mut self, hook: CertificateHook) -> Self {
        self.certificate_hook = Some(hook);
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn build(self) -> BundleResult<HttpTransport> {
        let mut builder = Client::builder()
            .user_agent(self.user_agent)
            .connect_timeout(self.connect_timeout);
        if let Some(hook) = &self.certificate_hook {
            builder = hook(builder);
        }
        let client = builder.build()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name("bundlefetch-http")
            .enable_all()
            .build()?;

        Ok(HttpTransport {
            runtime,
            client,
            dispatcher: self.dispatcher,
            request_hook: self.request_hook,
        })
    }
}

pub struct HttpTransport {
    runtime: Runtime,
    client: Client,
    dispatcher: Dispatcher,
    request_hook: Option<RequestHook>,
}

impl HttpTransport {
    pub fn builder(dispatcher: Dispatcher) -> HttpTransportBuilder {
        HttpTransportBuilder {
            dispatcher,
            user_agent: format!("bundlefetch/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(30),
            request_hook: None,
            certificate_hook: None,
            worker_threads: 2,
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: TransportRequest) -> BundleResult<Box<dyn TransferHandle>> {
        let mut builder = self.client.get(&request.url);
        if let Some(start) = request.range_start {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", start));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(hook) = &self.request_hook {
            builder = hook(builder);
        }

        let state = TransferState::new();
        let worker_state = Arc::clone(&state);
        let dispatcher = self.dispatcher.clone();
        let task = self.runtime.spawn(async move {
            let outcome = match fetch(builder, &request, &worker_state).await {
                Ok(status) => TransferOutcome::ok(status),
                Err(e) => {
                    let status = match &e {
                        BundleError::ServerError { status, .. } => Some(*status),
                        _ => None,
                    };
                    TransferOutcome::failed(status, e.to_string())
                }
            };
            debug!(url = %request.url, status = ?outcome.status, error = ?outcome.error, "http transfer finished");
            worker_state.finish(&dispatcher, outcome);
        });

        let abort = task.abort_handle();
        Ok(Box::new(
            WorkerTransfer::new(state).with_abort(move || abort.abort()),
        ))
    }
}

async fn fetch(
    builder: RequestBuilder,
    request: &TransportRequest,
    state: &TransferState,
) -> BundleResult<u16> {
    info!(url = %request.url, range_start = ?request.range_start, "starting transfer");
    let response = builder.send().await?;
    let status = response.status();

    if !status.is_success() {
        return Err(BundleError::ServerError {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        });
    }

    let resuming = request.range_start.is_some();
    if resuming && status != StatusCode::PARTIAL_CONTENT {
        warn!(url = %request.url, status = status.as_u16(), "server ignored range request");
        // The partial bytes can no longer be trusted against this mirror
        tokio::fs::File::create(&request.save_path).await?;
        return Err(BundleError::ServerError {
            status: status.as_u16(),
            message: "range request answered with full body".to_string(),
        });
    }

    if let Some(len) = response.content_length() {
        state.set_expected(len);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(resuming)
        .truncate(!resuming)
        .open(&request.save_path)
        .await?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if state.is_cancelled() {
            return Err(BundleError::Cancelled);
        }
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        state.add_bytes(chunk.len() as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(status.as_u16())
}
