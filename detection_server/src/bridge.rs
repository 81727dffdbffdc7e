//! Streams websocket image frames through a blocking detector.
//!
//! Each websocket gets a [`Session`] running two activities over a bounded
//! frame buffer:
//!
//! * the receive activity reads binary frames and offers them to the buffer,
//!   dropping the incoming frame when the buffer is full;
//! * the process activity takes one frame at a time, decodes and runs it
//!   through the detector on the blocking pool, then sends the JSON result.
//!
//! The first activity to finish ends the session and drops the other one.
//! A client disconnect ends the session with `Ok(())`, whether it sent a close
//! frame or just went away. Any other failure is returned to the caller.

use crate::telemetry::Metrics;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use object_detection::{decode_image, DetectionError, Detector, Objects};
use std::{error::Error as StdError, io, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::{self, JoinError},
};
use tracing::instrument;

/// One encoded image as received from the client.
pub type Frame = Bytes;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Websocket transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("Unexpected {0} message, expected binary image frames")]
    UnexpectedMessage(&'static str),
    #[error("Failed to decode frame: {0}")]
    Decode(#[source] image::ImageError),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("Detection task failed: {0}")]
    DetectionTask(#[from] JoinError),
    #[error("Failed to encode detection result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Creates a frame buffer holding at most `capacity` frames.
pub fn frame_slot(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSender { tx }, FrameReceiver { rx })
}

pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    /// Buffers `frame` if there is room. Never waits; when the buffer is full
    /// the frame is discarded and the buffered one is kept.
    pub fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
}

impl FrameReceiver {
    /// Waits for the next buffered frame. `None` once every sender is gone.
    pub async fn take(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

pub struct Session<D: Detector> {
    detector: Arc<D>,
    frame_buffer_capacity: usize,
    metrics: Arc<Metrics>,
}

impl<D: Detector> Session<D> {
    pub fn new(detector: Arc<D>, frame_buffer_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            detector,
            frame_buffer_capacity,
            metrics,
        }
    }

    /// Runs the session until the client disconnects or an activity fails.
    #[instrument(skip_all, fields(capacity = self.frame_buffer_capacity))]
    pub async fn run<S, K>(self, stream: &mut S, sink: &mut K) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
        K: Sink<Message, Error = axum::Error> + Unpin,
    {
        let (sender, receiver) = frame_slot(self.frame_buffer_capacity);
        self.metrics.record_session_opened();

        let result = tokio::select! {
            result = receive_frames(stream, sender, &self.metrics) => result,
            result = process_frames(receiver, sink, self.detector.clone(), &self.metrics) => result,
        };

        let outcome = if result.is_ok() { "disconnect" } else { "error" };
        self.metrics.record_session_closed(outcome);
        result
    }
}

async fn receive_frames<S>(
    stream: &mut S,
    slot: FrameSender,
    metrics: &Metrics,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) if is_disconnect(&err) => {
                tracing::debug!("Client went away without closing: {}", err);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match message {
            Message::Binary(frame) => {
                metrics.record_frame_received();
                if !slot.offer(frame) {
                    metrics.record_frame_dropped();
                    tracing::debug!("Frame buffer full, dropping frame");
                }
            }
            Message::Close(frame) => {
                tracing::debug!("Client closed the connection: {:?}", frame);
                return Ok(());
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Text(_) => return Err(SessionError::UnexpectedMessage("text")),
        }
    }

    tracing::debug!("Client stream ended");
    Ok(())
}

async fn process_frames<D, K>(
    mut slot: FrameReceiver,
    sink: &mut K,
    detector: Arc<D>,
    metrics: &Metrics,
) -> Result<(), SessionError>
where
    D: Detector,
    K: Sink<Message, Error = axum::Error> + Unpin,
{
    while let Some(frame) = slot.take().await {
        let started = Instant::now();
        let objects = detect(detector.clone(), frame).await?;
        metrics.record_inference_duration(started.elapsed().as_millis() as u64, "ws");

        tracing::debug!("Sending {} detections", objects.objects.len());
        let payload = serde_json::to_string(&objects)?;
        match sink.send(Message::Text(payload.into())).await {
            Ok(()) => metrics.record_result_sent("ws"),
            Err(err) if is_disconnect(&err) => {
                tracing::debug!("Client went away before the result was sent: {}", err);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Decodes and runs one frame on the blocking pool.
async fn detect<D: Detector>(detector: Arc<D>, frame: Frame) -> Result<Objects, SessionError> {
    task::spawn_blocking(move || -> Result<Objects, SessionError> {
        let image = decode_image(&frame).map_err(SessionError::Decode)?;
        Ok(detector.predict(&image)?)
    })
    .await?
}

// Errors raised by the websocket layer under axum once the peer is gone.
const PEER_GONE_MESSAGES: [&str; 3] = [
    "Connection reset without closing handshake",
    "Connection closed normally",
    "Trying to work with closed connection",
];

/// Whether a transport error only means the client went away.
fn is_disconnect(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        let message = err.to_string();
        if PEER_GONE_MESSAGES.contains(&message.as_str()) {
            return true;
        }
        source = err.source();
    }
    false
}
