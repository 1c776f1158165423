//! Resumable, backpressured streaming of one batch.
//!
//! The body is pulled one chunk at a time; the next chunk is only requested
//! after every record of the current one has been delivered (or parked), so a
//! pod never buffers more than one chunk. Reading stops once the batch's
//! declared size has been consumed.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delivery::{DeliveryClient, DeliveryOutcome, Record};
use crate::endpoint::{BatchDescriptor, Endpoint};
use crate::error::CollectorError;
use crate::framer::{frame, record_size, Envelope, EnvelopeContext};
use crate::pod::PodState;

/// How a batch stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The batch's offset reached its declared size.
    Complete,
    /// The body ended before the batch was fully delivered.
    Incomplete,
    /// The sink refused a record; it is queued for retry.
    SinkUnavailable,
    /// The pod was stopped mid-stream.
    Cancelled,
}

/// Build the HTTP client used against source endpoints.
///
/// Only connecting is bounded; batch bodies are followed for as long as the
/// source keeps them open.
pub fn source_http_client(connect_timeout: Duration) -> Result<Client, CollectorError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| CollectorError::Setup(e.to_string()))
}

/// Streams batch bodies from a source endpoint.
#[derive(Debug, Clone)]
pub struct BatchStreamer {
    http: Client,
    start_offset_supported: bool,
}

impl BatchStreamer {
    pub fn new(http: Client, start_offset_supported: bool) -> Self {
        Self {
            http,
            start_offset_supported,
        }
    }

    /// Deliver the undelivered part of `batch`.
    ///
    /// `sealed` marks a batch that is no longer the newest one on the
    /// endpoint; its unterminated last line is delivered as a final record.
    pub async fn stream(
        &self,
        endpoint: &Endpoint,
        batch: BatchDescriptor,
        sealed: bool,
        state: &mut PodState,
        delivery: &DeliveryClient,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, CollectorError> {
        let target = endpoint.target_url.as_str();
        let delivered = state.offsets.delivered(batch.id).await?;
        let server_skip = self.start_offset_supported && delivered > 0;
        let url = endpoint.batch_url(batch.id, server_skip.then_some(delivered));
        let ctx = EnvelopeContext::new(
            batch.id,
            endpoint.source_identifier(),
            &endpoint.service_name,
        );

        debug!(
            target_url = %target,
            batch_id = batch.id,
            batch_size = batch.batch_size,
            delivered = delivered,
            url = %url,
            "Streaming batch"
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            response = self.http.get(&url).send() => {
                response.map_err(|e| CollectorError::stream(target, batch.id, e))?
            }
        };
        let mut response = response
            .error_for_status()
            .map_err(|e| CollectorError::stream(target, batch.id, e))?;

        // Absolute batch position of the end of the data handed to the framer
        let mut consumed = if server_skip { delivered } else { 0 };
        state.remainder.clear();

        while consumed < batch.batch_size {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                chunk = response.chunk() => {
                    chunk.map_err(|e| CollectorError::stream(target, batch.id, e))?
                }
            };
            let Some(chunk) = chunk else {
                break;
            };

            let mut data: &[u8] = &chunk;

            // Source does not honour start offsets: drop what was already delivered
            if consumed < delivered {
                let skip = ((delivered - consumed) as usize).min(data.len());
                data = &data[skip..];
                consumed += skip as u64;
            }

            let room = (batch.batch_size - consumed) as usize;
            if data.len() > room {
                data = &data[..room];
            }
            if data.is_empty() {
                continue;
            }
            consumed += data.len() as u64;

            let framed = frame(&state.remainder, data);
            state.remainder = framed.remainder;

            for line in framed.records {
                let size = record_size(&line);
                if let Some(end) = self.forward(&line, size, &ctx, state, delivery).await? {
                    return Ok(end);
                }
            }
        }
        drop(response);

        if sealed && consumed == batch.batch_size && !state.remainder.is_empty() {
            let line = std::mem::take(&mut state.remainder);
            debug!(
                target_url = %target,
                batch_id = batch.id,
                bytes = line.len(),
                "Flushing unterminated last line of sealed batch"
            );
            let size = line.len() as u64;
            if let Some(end) = self.forward(&line, size, &ctx, state, delivery).await? {
                return Ok(end);
            }
        }

        let delivered = state.offsets.delivered(batch.id).await?;
        if delivered >= batch.batch_size {
            Ok(StreamEnd::Complete)
        } else {
            Ok(StreamEnd::Incomplete)
        }
    }

    /// Deliver one framed line. Blank lines are committed without a sink call.
    async fn forward(
        &self,
        line: &[u8],
        size: u64,
        ctx: &EnvelopeContext,
        state: &mut PodState,
        delivery: &DeliveryClient,
    ) -> Result<Option<StreamEnd>, CollectorError> {
        let Some(envelope) = Envelope::from_line(line, ctx) else {
            state.offsets.commit(ctx.batch_id, size).await?;
            return Ok(None);
        };

        let record = Record {
            batch_id: ctx.batch_id,
            position: state.offsets.delivered(ctx.batch_id).await?,
            payload: envelope.to_bytes(),
            size,
        };

        match delivery
            .deliver(record, &mut state.offsets, &mut state.retries)
            .await?
        {
            DeliveryOutcome::Delivered { .. } => Ok(None),
            DeliveryOutcome::Queued { .. } => Ok(Some(StreamEnd::SinkUnavailable)),
        }
    }
}
