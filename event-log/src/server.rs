use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Interceptor;
use tonic::{transport::Server, Request, Response, Status};

use crate::entry::{EntryKind, LogEntry};
use crate::feed_proto::event_feed_server::{EventFeed, EventFeedServer};
use crate::feed_proto::{
    AckEventsRequest, AckEventsResponse, Event, HealthCheckRequest, HealthCheckResponse,
    ListEventsRequest, ListEventsResponse,
};
use crate::log::EventLog;

const MAX_LIST_LIMIT: u32 = 10_000;

/// gRPC feed running on its own thread and runtime. Dropping the handle shuts the
/// server down and joins the thread.
pub struct TcpServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Drop for TcpServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl TcpServerHandle {
    pub fn spawn(addr: SocketAddr, log_path: PathBuf, token: String) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread = thread::spawn(move || -> Result<()> {
            let runtime = Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .context("failed to bind tcp listener")?;
                tracing::info!(%addr, "event feed listening");
                let svc = FeedService::new(Arc::new(log_path));
                let interceptor = AuthInterceptor {
                    token: Arc::new(token),
                };
                Server::builder()
                    .add_service(EventFeedServer::with_interceptor(svc, interceptor))
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .context("grpc server exited with error")?;
                Ok(())
            })
        });

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

struct FeedService {
    log_path: Arc<PathBuf>,
}

impl FeedService {
    fn new(log_path: Arc<PathBuf>) -> Self {
        Self { log_path }
    }

    fn open_log(&self) -> Result<EventLog, Status> {
        EventLog::open(&*self.log_path).map_err(|err| Status::internal(err.to_string()))
    }
}

#[tonic::async_trait]
impl EventFeed for FeedService {
    async fn health_check(
        &self,
        _: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let log = self.open_log()?;
        let head_offset = log
            .head_offset()
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(HealthCheckResponse {
            status: "ok".to_string(),
            head_offset,
        }))
    }

    async fn list_events(
        &self,
        request: Request<ListEventsRequest>,
    ) -> Result<Response<ListEventsResponse>, Status> {
        let req = request.into_inner();
        let limit = req.limit.clamp(1, MAX_LIST_LIMIT) as usize;
        let kind = if req.kind.is_empty() {
            None
        } else {
            Some(
                req.kind
                    .parse::<EntryKind>()
                    .map_err(|err| Status::invalid_argument(err.to_string()))?,
            )
        };
        let log = self.open_log()?;
        let after = if req.after_offset > 0 || req.consumer.is_empty() {
            req.after_offset
        } else {
            log.cursor(&req.consumer)
                .map_err(|err| Status::internal(err.to_string()))?
                .unwrap_or(0)
        };
        let rows = log
            .list_after(kind, after, limit)
            .map_err(|err| Status::internal(err.to_string()))?;
        let events = rows.into_iter().map(entry_to_proto).collect();
        Ok(Response::new(ListEventsResponse { events }))
    }

    async fn ack_events(
        &self,
        request: Request<AckEventsRequest>,
    ) -> Result<Response<AckEventsResponse>, Status> {
        let req = request.into_inner();
        if req.consumer.is_empty() {
            return Err(Status::invalid_argument("consumer is required"));
        }
        let log = self.open_log()?;
        let cursor = log
            .set_cursor(&req.consumer, req.up_to_offset)
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(AckEventsResponse { cursor }))
    }
}

fn entry_to_proto(entry: LogEntry) -> Event {
    Event {
        offset: entry.offset,
        topic: entry.topic,
        partition: entry.partition,
        key: entry.key,
        kind: entry.kind.as_str().to_string(),
        payload: entry.payload,
        created_at: entry.created_at,
    }
}

#[derive(Clone)]
struct AuthInterceptor {
    token: Arc<String>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?;
        let expected = format!("Bearer {}", self.token.as_ref());
        if header
            .to_str()
            .map(|value| value == expected)
            .unwrap_or(false)
        {
            Ok(request)
        } else {
            Err(Status::unauthenticated("invalid authorization header"))
        }
    }
}
