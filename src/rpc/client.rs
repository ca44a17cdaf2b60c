use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::codec::{self, read_frame, write_frame};
use crate::catalog::ArcCatalog;
use crate::error::{MasterError, MasterResult, WorkerError, WorkerResult};
use crate::model::{Datagram, ProcessingTask, StreamingWindow, VelocityResult};
use crate::proto as pb;
use crate::proto::request::Body as RequestBody;
use crate::proto::response::Body as ResponseBody;
use crate::worker::Worker;

/// One request/response exchange on a fresh connection, bounded by `timeout`.
///
/// Dropping the returned future closes the connection.
pub async fn call(addr: &str, timeout: Duration, body: RequestBody) -> WorkerResult<ResponseBody> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, &pb::Request { body: Some(body) }).await?;

        let response: pb::Response = read_frame(&mut stream).await?.ok_or_else(|| {
            WorkerError::Transport("connection closed before a response".to_string())
        })?;
        response
            .body
            .ok_or_else(|| WorkerError::Codec("empty response".to_string()))
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WorkerError::Timeout(timeout))?
}

fn unexpected(body: &ResponseBody) -> WorkerError {
    WorkerError::Codec(format!("unexpected response: {:?}", body))
}

/// A worker in another process, reached over TCP.
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    endpoint: String,
    timeout: Duration,
}

impl RemoteWorker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, body: RequestBody) -> WorkerResult<ResponseBody> {
        call(&self.endpoint, self.timeout, body).await
    }

    fn into_result(body: ResponseBody) -> WorkerResult<VelocityResult> {
        match body {
            ResponseBody::Result(result) => Ok(result.into()),
            ResponseBody::Error(reply) => Err(reply.into()),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl Worker for RemoteWorker {
    async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult> {
        debug!(endpoint = %self.endpoint, task_id = %task.task_id, "Sending task");
        let body = self
            .call(RequestBody::ProcessTask(pb::ProcessingTask::from(&task)))
            .await?;
        Self::into_result(body)
    }

    async fn process_streaming_window(
        &self,
        window: StreamingWindow,
        catalog: Arc<ArcCatalog>,
    ) -> WorkerResult<VelocityResult> {
        let request = pb::StreamingRequest {
            window: Some(pb::StreamingWindow::from(&window)),
            arcs: codec::catalog_to_proto(&catalog),
        };
        let body = self
            .call(RequestBody::ProcessStreamingWindow(request))
            .await?;
        Self::into_result(body)
    }

    async fn is_alive(&self) -> WorkerResult<bool> {
        match self.call(RequestBody::IsAlive(pb::Empty {})).await? {
            ResponseBody::Alive(alive) => Ok(alive),
            ResponseBody::Error(reply) => Err(reply.into()),
            other => Err(unexpected(&other)),
        }
    }

    async fn system_status(&self) -> WorkerResult<String> {
        match self.call(RequestBody::GetSystemStatus(pb::Empty {})).await? {
            ResponseBody::Status(status) => Ok(status),
            ResponseBody::Error(reply) => Err(reply.into()),
            other => Err(unexpected(&other)),
        }
    }
}

/// The master's surface as seen by workers and the command line.
#[derive(Debug, Clone)]
pub struct MasterClient {
    addr: String,
    timeout: Duration,
}

impl MasterClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn call(&self, body: RequestBody) -> MasterResult<ResponseBody> {
        match call(&self.addr, self.timeout, body).await {
            Ok(ResponseBody::Error(reply)) => Err(reply.into()),
            Ok(body) => Ok(body),
            Err(e) => Err(MasterError::Transport(e.to_string())),
        }
    }

    /// Fails with [`MasterError::RegistrationRejected`] when the master is full.
    pub async fn register(&self, worker_id: &str, endpoint: &str) -> MasterResult<()> {
        let handle = pb::WorkerHandle {
            worker_id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
        };
        match self.call(RequestBody::RegisterWorker(handle)).await? {
            ResponseBody::Accepted(true) => Ok(()),
            ResponseBody::Accepted(false) => Err(MasterError::RegistrationRejected {
                worker_id: worker_id.to_string(),
                max_workers: 0,
            }),
            other => Err(MasterError::Transport(unexpected(&other).to_string())),
        }
    }

    /// Returns whether the master knew the worker.
    pub async fn unregister(&self, worker_id: &str, endpoint: &str) -> MasterResult<bool> {
        let handle = pb::WorkerHandle {
            worker_id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
        };
        match self.call(RequestBody::UnregisterWorker(handle)).await? {
            ResponseBody::Accepted(known) => Ok(known),
            other => Err(MasterError::Transport(unexpected(&other).to_string())),
        }
    }

    pub async fn process_historical(
        &self,
        datagrams: &[Datagram],
    ) -> MasterResult<Vec<VelocityResult>> {
        let request = pb::HistoricalRequest {
            datagrams: codec::datagrams_to_proto(datagrams),
        };
        self.expect_results(RequestBody::ProcessHistorical(request))
            .await
    }

    pub async fn process_streaming(
        &self,
        window: &StreamingWindow,
    ) -> MasterResult<Vec<VelocityResult>> {
        self.expect_results(RequestBody::ProcessStreaming(pb::StreamingWindow::from(
            window,
        )))
        .await
    }

    pub async fn system_status(&self) -> MasterResult<String> {
        match self.call(RequestBody::GetSystemStatus(pb::Empty {})).await? {
            ResponseBody::Status(status) => Ok(status),
            other => Err(MasterError::Transport(unexpected(&other).to_string())),
        }
    }

    async fn expect_results(&self, body: RequestBody) -> MasterResult<Vec<VelocityResult>> {
        match self.call(body).await? {
            ResponseBody::Results(list) => Ok(codec::results_from_proto(list)),
            other => Err(MasterError::Transport(unexpected(&other).to_string())),
        }
    }
}
