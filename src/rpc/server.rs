use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, debug, info, warn};

use super::client::RemoteWorker;
use super::codec::{self, bad_request, read_frame, write_frame};
use crate::error::{MasterError, WorkerResult};
use crate::master::{DistributedMaster, WorkerHandle};
use crate::model::{ProcessingTask, StreamingWindow, VelocityResult};
use crate::proto as pb;
use crate::proto::request::Body as RequestBody;
use crate::proto::response::Body as ResponseBody;
use crate::worker::Worker;

/// Answers requests on one connection until the peer closes it.
async fn serve_connection<H, Fut>(mut stream: TcpStream, handle: H) -> WorkerResult<()>
where
    H: Fn(pb::Request) -> Fut,
    Fut: Future<Output = ResponseBody>,
{
    while let Some(request) = read_frame::<_, pb::Request>(&mut stream).await? {
        let body = handle(request).await;
        write_frame(&mut stream, &pb::Response { body: Some(body) }).await?;
    }
    Ok(())
}

/// Accepts connections until `shutdown` resolves, spawning one task per connection.
async fn accept_loop<S, H, Fut>(listener: TcpListener, shutdown: S, handle: H) -> io::Result<()>
where
    S: Future<Output = ()>,
    H: Fn(pb::Request) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ResponseBody> + Send,
{
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down listener");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let handle = handle.clone();
        let span = tracing::debug_span!("connection", peer = %peer);
        tokio::spawn(
            async move {
                if let Err(e) = serve_connection(stream, handle).await {
                    warn!(error = %e, "Connection ended with error");
                }
            }
            .instrument(span),
        );
    }
}

/// Serves the worker surface of `worker` on `listener`.
pub async fn serve_worker<S>(
    listener: TcpListener,
    worker: Arc<dyn Worker>,
    shutdown: S,
) -> io::Result<()>
where
    S: Future<Output = ()>,
{
    info!(addr = %listener.local_addr()?, "Worker listening");
    accept_loop(listener, shutdown, move |request| {
        let worker = worker.clone();
        async move { handle_worker_request(worker.as_ref(), request).await }
    })
    .await
}

async fn handle_worker_request(worker: &dyn Worker, request: pb::Request) -> ResponseBody {
    let Some(body) = request.body else {
        return ResponseBody::Error(bad_request("empty request"));
    };

    match body {
        RequestBody::ProcessTask(task) => match ProcessingTask::try_from(task) {
            Ok(task) => result_body(worker.process_task(task).await),
            Err(e) => ResponseBody::Error(bad_request(e.to_string())),
        },
        RequestBody::ProcessStreamingWindow(request) => {
            let catalog = Arc::new(codec::catalog_from_proto(request.arcs));
            let window = request
                .window
                .ok_or_else(|| "streaming request without a window".to_string())
                .and_then(|w| StreamingWindow::try_from(w).map_err(|e| e.to_string()));
            match window {
                Ok(window) => result_body(worker.process_streaming_window(window, catalog).await),
                Err(reason) => ResponseBody::Error(bad_request(reason)),
            }
        }
        RequestBody::IsAlive(_) => match worker.is_alive().await {
            Ok(alive) => ResponseBody::Alive(alive),
            Err(e) => ResponseBody::Error((&e).into()),
        },
        RequestBody::GetSystemStatus(_) => match worker.system_status().await {
            Ok(status) => ResponseBody::Status(status),
            Err(e) => ResponseBody::Error((&e).into()),
        },
        RequestBody::RegisterWorker(_)
        | RequestBody::UnregisterWorker(_)
        | RequestBody::ProcessHistorical(_)
        | RequestBody::ProcessStreaming(_) => {
            ResponseBody::Error(bad_request("request is served by the master, not a worker"))
        }
    }
}

fn result_body(result: WorkerResult<VelocityResult>) -> ResponseBody {
    match result {
        Ok(result) => ResponseBody::Result((&result).into()),
        Err(e) => ResponseBody::Error((&e).into()),
    }
}

/// Serves the master surface on `listener`. Registered workers are called back over TCP
/// with `rpc_timeout` per call.
pub async fn serve_master<S>(
    listener: TcpListener,
    master: Arc<DistributedMaster>,
    rpc_timeout: Duration,
    shutdown: S,
) -> io::Result<()>
where
    S: Future<Output = ()>,
{
    info!(addr = %listener.local_addr()?, "Master listening");
    accept_loop(listener, shutdown, move |request| {
        let master = master.clone();
        async move { handle_master_request(&master, rpc_timeout, request).await }
    })
    .await
}

async fn handle_master_request(
    master: &DistributedMaster,
    rpc_timeout: Duration,
    request: pb::Request,
) -> ResponseBody {
    let Some(body) = request.body else {
        return ResponseBody::Error(bad_request("empty request"));
    };

    match body {
        RequestBody::RegisterWorker(handle) => {
            let worker = Arc::new(RemoteWorker::new(handle.endpoint.clone(), rpc_timeout));
            let accepted = master
                .register_worker(WorkerHandle::new(
                    handle.worker_id.clone(),
                    handle.endpoint,
                    worker,
                ))
                .await;
            if accepted {
                ResponseBody::Accepted(true)
            } else {
                let err = MasterError::RegistrationRejected {
                    worker_id: handle.worker_id,
                    max_workers: master.registry().max_workers(),
                };
                ResponseBody::Error((&err).into())
            }
        }
        RequestBody::UnregisterWorker(handle) => {
            ResponseBody::Accepted(master.unregister_worker(&handle.endpoint).await)
        }
        RequestBody::ProcessHistorical(request) => {
            match codec::datagrams_from_proto(request.datagrams) {
                Ok(datagrams) => results_body(master.process_historical(datagrams).await),
                Err(e) => ResponseBody::Error(bad_request(e.to_string())),
            }
        }
        RequestBody::ProcessStreaming(window) => match StreamingWindow::try_from(window) {
            Ok(window) => results_body(master.process_streaming_window(window).await),
            Err(e) => ResponseBody::Error(bad_request(e.to_string())),
        },
        RequestBody::GetSystemStatus(_) => ResponseBody::Status(master.system_status().await),
        RequestBody::IsAlive(_) => ResponseBody::Alive(true),
        RequestBody::ProcessTask(_) | RequestBody::ProcessStreamingWindow(_) => {
            debug!("Worker request sent to master");
            ResponseBody::Error(bad_request("request is served by a worker, not the master"))
        }
    }
}

fn results_body(results: Result<Vec<VelocityResult>, MasterError>) -> ResponseBody {
    match results {
        Ok(results) => ResponseBody::Results(codec::results_to_proto(&results)),
        Err(e) => ResponseBody::Error((&e).into()),
    }
}
