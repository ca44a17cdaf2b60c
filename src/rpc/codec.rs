//! Length-prefixed protobuf framing and conversions between wire and domain types.
//!
//! A frame is a 4-byte big-endian body length followed by the encoded message.

use bytes::{BufMut, BytesMut};
use chrono::{TimeZone, Utc};
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::catalog::{ArcCatalog, Direction, RouteArc, Stop};
use crate::error::{MasterError, WorkerError, WorkerResult};
use crate::model::{ArcVelocity, Datagram, ProcessingTask, StreamingWindow, VelocityResult};
use crate::proto as pb;
use crate::proto::ErrorKind;

pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> WorkerResult<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let len = message.encoded_len();
    if len > MAX_FRAME_BYTES {
        return Err(WorkerError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_BYTES
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    message
        .encode(&mut buf)
        .map_err(|e| WorkerError::Codec(e.to_string()))?;

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection between frames;
/// a close inside the length prefix or the body is a transport error.
pub async fn read_frame<R, M>(reader: &mut R) -> WorkerResult<Option<M>>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let mut header = [0u8; 4];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[first..]).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WorkerError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_BYTES
        )));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;

    M::decode(buf.freeze())
        .map(Some)
        .map_err(|e| WorkerError::Codec(e.to_string()))
}

impl From<&Datagram> for pb::Datagram {
    fn from(d: &Datagram) -> Self {
        Self {
            event_type: d.event_type,
            vehicle_id: d.vehicle_id.clone(),
            trip_id: d.trip_id.clone(),
            line_id: d.line_id.clone(),
            stop_id: d.stop_id.clone(),
            odometer_meters: d.odometer_meters,
            latitude: d.latitude,
            longitude: d.longitude,
            timestamp: d.timestamp.timestamp(),
        }
    }
}

impl TryFrom<pb::Datagram> for Datagram {
    type Error = WorkerError;

    fn try_from(d: pb::Datagram) -> Result<Self, Self::Error> {
        Ok(Self {
            event_type: d.event_type,
            vehicle_id: d.vehicle_id,
            trip_id: d.trip_id,
            line_id: d.line_id,
            stop_id: d.stop_id,
            odometer_meters: d.odometer_meters,
            latitude: d.latitude,
            longitude: d.longitude,
            timestamp: timestamp(d.timestamp)?,
        })
    }
}

fn timestamp(secs: i64) -> WorkerResult<chrono::DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| WorkerError::Codec(format!("timestamp {} out of range", secs)))
}

pub fn datagrams_to_proto(datagrams: &[Datagram]) -> Vec<pb::Datagram> {
    datagrams.iter().map(pb::Datagram::from).collect()
}

pub fn datagrams_from_proto(datagrams: Vec<pb::Datagram>) -> WorkerResult<Vec<Datagram>> {
    datagrams.into_iter().map(Datagram::try_from).collect()
}

impl From<&RouteArc> for pb::RouteArc {
    fn from(arc: &RouteArc) -> Self {
        Self {
            line_id: arc.line_id.clone(),
            direction: arc.direction.orientation(),
            start_sequence: arc.start_sequence,
            end_sequence: arc.end_sequence,
            start_stop_id: arc.start_stop_id.clone(),
            end_stop_id: arc.end_stop_id.clone(),
            distance_meters: arc.distance_meters,
        }
    }
}

impl From<pb::RouteArc> for RouteArc {
    fn from(arc: pb::RouteArc) -> Self {
        Self {
            line_id: arc.line_id,
            direction: Direction::from_orientation(arc.direction),
            start_sequence: arc.start_sequence,
            end_sequence: arc.end_sequence,
            start_stop_id: arc.start_stop_id,
            end_stop_id: arc.end_stop_id,
            distance_meters: arc.distance_meters,
        }
    }
}

/// Only the arcs travel; workers have no use for stop metadata.
pub fn catalog_to_proto(catalog: &ArcCatalog) -> Vec<pb::RouteArc> {
    catalog.arcs().iter().map(pb::RouteArc::from).collect()
}

pub fn catalog_from_proto(arcs: Vec<pb::RouteArc>) -> ArcCatalog {
    ArcCatalog::new(
        Vec::<Stop>::new(),
        arcs.into_iter().map(RouteArc::from).collect(),
    )
}

impl From<&ProcessingTask> for pb::ProcessingTask {
    fn from(task: &ProcessingTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            datagrams: datagrams_to_proto(task.datagrams()),
            arcs: catalog_to_proto(&task.catalog),
            partition_index: task.partition_index as u32,
            partition_count: task.partition_count as u32,
        }
    }
}

impl TryFrom<pb::ProcessingTask> for ProcessingTask {
    type Error = WorkerError;

    fn try_from(task: pb::ProcessingTask) -> Result<Self, Self::Error> {
        Ok(ProcessingTask::from_datagrams(
            task.task_id,
            datagrams_from_proto(task.datagrams)?,
            Arc::new(catalog_from_proto(task.arcs)),
            task.partition_index as usize,
            task.partition_count as usize,
        ))
    }
}

impl From<&StreamingWindow> for pb::StreamingWindow {
    fn from(window: &StreamingWindow) -> Self {
        Self {
            window_id: window.window_id.clone(),
            datagrams: datagrams_to_proto(&window.datagrams),
            start_timestamp: window.start.timestamp(),
            end_timestamp: window.end.timestamp(),
        }
    }
}

impl TryFrom<pb::StreamingWindow> for StreamingWindow {
    type Error = WorkerError;

    fn try_from(window: pb::StreamingWindow) -> Result<Self, Self::Error> {
        Ok(Self {
            window_id: window.window_id,
            datagrams: datagrams_from_proto(window.datagrams)?,
            start: timestamp(window.start_timestamp)?,
            end: timestamp(window.end_timestamp)?,
        })
    }
}

impl From<&ArcVelocity> for pb::ArcVelocity {
    fn from(arc: &ArcVelocity) -> Self {
        Self {
            arc_id: arc.arc_id.clone(),
            line_id: arc.line_id.clone(),
            average_velocity: arc.average_velocity,
            sample_count: arc.sample_count,
        }
    }
}

impl From<pb::ArcVelocity> for ArcVelocity {
    fn from(arc: pb::ArcVelocity) -> Self {
        Self {
            arc_id: arc.arc_id,
            line_id: arc.line_id,
            average_velocity: arc.average_velocity,
            sample_count: arc.sample_count,
        }
    }
}

impl From<&VelocityResult> for pb::VelocityResult {
    fn from(result: &VelocityResult) -> Self {
        Self {
            arc_id: result.arc_id.clone(),
            task_id: result.task_id.clone(),
            average_velocity: result.average_velocity,
            sample_count: result.sample_count,
            processing_time_millis: result.processing_time_millis,
            arcs: result.arcs.iter().map(pb::ArcVelocity::from).collect(),
            error: result.error.clone(),
        }
    }
}

impl From<pb::VelocityResult> for VelocityResult {
    fn from(result: pb::VelocityResult) -> Self {
        Self {
            arc_id: result.arc_id,
            task_id: result.task_id,
            average_velocity: result.average_velocity,
            sample_count: result.sample_count,
            processing_time_millis: result.processing_time_millis,
            arcs: result.arcs.into_iter().map(ArcVelocity::from).collect(),
            error: result.error,
        }
    }
}

pub fn results_to_proto(results: &[VelocityResult]) -> pb::ResultList {
    pb::ResultList {
        results: results.iter().map(pb::VelocityResult::from).collect(),
    }
}

pub fn results_from_proto(list: pb::ResultList) -> Vec<VelocityResult> {
    list.results.into_iter().map(VelocityResult::from).collect()
}

fn reply(kind: ErrorKind, message: String, subject: String, limit: u64) -> pb::ErrorReply {
    pb::ErrorReply {
        kind: kind as i32,
        message,
        subject,
        limit,
    }
}

impl From<&MasterError> for pb::ErrorReply {
    fn from(err: &MasterError) -> Self {
        match err {
            MasterError::NoWorkersAvailable => reply(
                ErrorKind::NoWorkersAvailable,
                err.to_string(),
                String::new(),
                0,
            ),
            MasterError::ProcessingTimeout { timeout } => reply(
                ErrorKind::ProcessingTimeout,
                err.to_string(),
                String::new(),
                timeout.as_millis() as u64,
            ),
            MasterError::StreamingProcessingFailed { window_id, reason } => reply(
                ErrorKind::StreamingProcessingFailed,
                reason.clone(),
                window_id.clone(),
                0,
            ),
            MasterError::RegistrationRejected {
                worker_id,
                max_workers,
            } => reply(
                ErrorKind::RegistrationRejected,
                err.to_string(),
                worker_id.clone(),
                *max_workers as u64,
            ),
            MasterError::Transport(message) => {
                reply(ErrorKind::Internal, message.clone(), String::new(), 0)
            }
        }
    }
}

impl From<pb::ErrorReply> for MasterError {
    fn from(reply: pb::ErrorReply) -> Self {
        match reply.kind() {
            ErrorKind::NoWorkersAvailable => MasterError::NoWorkersAvailable,
            ErrorKind::ProcessingTimeout => MasterError::ProcessingTimeout {
                timeout: Duration::from_millis(reply.limit),
            },
            ErrorKind::StreamingProcessingFailed => MasterError::StreamingProcessingFailed {
                window_id: reply.subject,
                reason: reply.message,
            },
            ErrorKind::RegistrationRejected => MasterError::RegistrationRejected {
                worker_id: reply.subject,
                max_workers: reply.limit as usize,
            },
            kind => MasterError::Transport(format!("{}: {}", kind.as_str_name(), reply.message)),
        }
    }
}

impl From<&WorkerError> for pb::ErrorReply {
    fn from(err: &WorkerError) -> Self {
        match err {
            WorkerError::TaskFailed { task_id, reason } => {
                reply(ErrorKind::TaskFailed, reason.clone(), task_id.clone(), 0)
            }
            other => reply(ErrorKind::Internal, other.to_string(), String::new(), 0),
        }
    }
}

impl From<pb::ErrorReply> for WorkerError {
    fn from(reply: pb::ErrorReply) -> Self {
        match reply.kind() {
            ErrorKind::TaskFailed => WorkerError::TaskFailed {
                task_id: reply.subject,
                reason: reply.message,
            },
            kind => WorkerError::Remote {
                kind: kind.as_str_name().to_string(),
                message: reply.message,
            },
        }
    }
}

pub fn bad_request(message: impl Into<String>) -> pb::ErrorReply {
    reply(ErrorKind::BadRequest, message.into(), String::new(), 0)
}
