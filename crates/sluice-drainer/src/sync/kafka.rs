//! Single-producer message sink over Kafka.
//!
//! All records go to one partition so downstream consumers see a single
//! ordered stream. Payloads over the slice threshold are split into
//! slices carrying `{messageID, no, total}` headers, with a checksum
//! header on the final slice only.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;

use sluice_loader::Txn;

use super::Syncer;
use crate::DrainerError;

/// Header key of the slice message id.
const HDR_MESSAGE_ID: &str = "messageID";
/// Header key of the slice number.
const HDR_NO: &str = "no";
/// Header key of the slice count.
const HDR_TOTAL: &str = "total";
/// Header key of the whole-payload checksum, final slice only.
const HDR_CHECKSUM: &str = "checksum";

/// Split threshold and slice size.
const DEFAULT_SLICE_BYTES: usize = 1024 * 1024;

/// Ordered message sink for one Kafka topic partition.
pub struct KafkaSyncer {
    producer: FutureProducer,
    topic: String,
    slice_bytes: usize,
    success_tx: mpsc::Sender<Txn>,
    success_rx: Option<mpsc::Receiver<Txn>>,
}

impl KafkaSyncer {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, DrainerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.max.bytes", "1073741824")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| DrainerError::Message(e.to_string()))?;
        let (success_tx, success_rx) = mpsc::channel(super::SUCCESS_CHAN_SIZE);
        Ok(Self {
            producer,
            topic: topic.into(),
            slice_bytes: DEFAULT_SLICE_BYTES,
            success_tx,
            success_rx: Some(success_rx),
        })
    }

    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), DrainerError> {
        if payload.len() <= self.slice_bytes {
            return self.send_one(key, payload, None).await;
        }

        let total = payload.len().div_ceil(self.slice_bytes);
        let checksum = crc32c::crc32c(payload);
        for (no, chunk) in payload.chunks(self.slice_bytes).enumerate() {
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: HDR_MESSAGE_ID,
                    value: Some(key.as_bytes()),
                })
                .insert(Header {
                    key: HDR_NO,
                    value: Some(&(no as u32).to_le_bytes()[..]),
                })
                .insert(Header {
                    key: HDR_TOTAL,
                    value: Some(&(total as u32).to_le_bytes()[..]),
                });
            let headers = if no + 1 == total {
                headers.insert(Header {
                    key: HDR_CHECKSUM,
                    value: Some(&checksum.to_le_bytes()[..]),
                })
            } else {
                headers
            };
            self.send_one(key, chunk, Some(headers)).await?;
        }
        Ok(())
    }

    async fn send_one(
        &self,
        key: &str,
        payload: &[u8],
        headers: Option<OwnedHeaders>,
    ) -> Result<(), DrainerError> {
        let mut record = FutureRecord::to(&self.topic)
            .partition(0)
            .key(key)
            .payload(payload);
        if let Some(headers) = headers {
            record = record.headers(headers);
        }
        self.producer
            .send(record, Timeout::After(Duration::from_secs(30)))
            .await
            .map(|_| ())
            .map_err(|(e, _)| DrainerError::Message(e.to_string()))
    }
}

#[async_trait]
impl Syncer for KafkaSyncer {
    async fn sync(&mut self, txn: Txn) -> Result<(), DrainerError> {
        let payload =
            serde_json::to_vec(&txn).map_err(|e| DrainerError::Message(e.to_string()))?;
        let key = txn.commit_ts.to_string();
        self.publish(&key, &payload).await?;
        // Delivery confirmed above; safe to acknowledge.
        self.success_tx
            .send(txn)
            .await
            .map_err(|_| DrainerError::ChannelClosed)
    }

    fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>> {
        self.success_rx.take()
    }

    async fn close(self: Box<Self>) -> Result<(), DrainerError> {
        Ok(())
    }
}
