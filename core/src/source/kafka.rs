use std::future::Future;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::dead_letter::{DeadLetterLog, DeadLetterRecord};
use crate::errors::SourceError;
use crate::source::{LogReader, LogRecord};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_WAIT: Duration = Duration::from_millis(5);

fn client_config(config: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.bootstrap_servers);

    if let Some(security_protocol) = &config.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &config.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &config.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }
    client_config
}

fn connection(e: KafkaError) -> SourceError {
    SourceError::Connection { source: Box::new(e) }
}

/// One consumer pinned to a single partition for one consumer group.
///
/// Offsets are owned by the checkpoint manager, so the consumer never commits
/// and never resets: reading an offset the broker has expired surfaces as
/// [`SourceError::RetentionExceeded`].
pub struct KafkaLogReader {
    consumer: StreamConsumer,
    topic: String,
    partition: u32,
    group: String,
    next: u64,
    poll_timeout: Duration,
}

impl KafkaLogReader {
    pub fn new(config: &KafkaOptions, group: &str, partition: u32) -> Result<Self, SourceError> {
        let mut client_config = client_config(config);
        client_config
            .set("group.id", group)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "error")
            .set(
                "session.timeout.ms",
                config.session_timeout_ms.unwrap_or(6000).to_string(),
            );

        let consumer: StreamConsumer = client_config.create().map_err(connection)?;

        let (low, _high) = consumer
            .fetch_watermarks(&config.topic, partition as i32, METADATA_TIMEOUT)
            .map_err(connection)?;

        let mut reader = Self {
            consumer,
            topic: config.topic.clone(),
            partition,
            group: group.to_string(),
            next: low.max(0) as u64,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms.unwrap_or(500)),
        };
        reader.assign(reader.next)?;
        info!(
            topic = %reader.topic,
            partition,
            group,
            offset = reader.next,
            "Assigned Kafka partition"
        );
        Ok(reader)
    }

    fn assign(&self, offset: u64) -> Result<(), SourceError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition as i32, Offset::Offset(offset as i64))
            .map_err(connection)?;
        self.consumer.assign(&tpl).map_err(connection)
    }

    fn retention_exceeded(&self) -> SourceError {
        let earliest = self
            .consumer
            .fetch_watermarks(&self.topic, self.partition as i32, METADATA_TIMEOUT)
            .map(|(low, _)| low.max(0) as u64)
            .unwrap_or(self.next);
        SourceError::RetentionExceeded {
            partition: self.partition,
            group: self.group.clone(),
            requested: self.next,
            earliest,
        }
    }

}

/// Source of single records with a bounded wait.
trait RecordPoll: Send {
    /// Receives one record, or `None` when the wait times out.
    fn recv_one(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<LogRecord>, SourceError>> + Send;
}

/// Appends records that are immediately ready, up to `max`.
///
/// Records already received count as delivered: the consumer position has
/// moved past them. An error after the first record ends the batch early and
/// is left for the next poll to surface again.
async fn drain_ready<P: RecordPoll>(
    poller: &mut P,
    mut records: Vec<LogRecord>,
    max: usize,
) -> Result<Vec<LogRecord>, SourceError> {
    while records.len() < max {
        match poller.recv_one(DRAIN_WAIT).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => break,
            Err(e) if records.is_empty() => return Err(e),
            Err(e) => {
                debug!(error = %e, delivered = records.len(), "ending batch early");
                break;
            }
        }
    }
    Ok(records)
}

impl RecordPoll for KafkaLogReader {
    async fn recv_one(&mut self, wait: Duration) -> Result<Option<LogRecord>, SourceError> {
        let received = match timeout(wait, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received.map(|message| LogRecord {
                partition: message.partition() as u32,
                offset: message.offset() as u64,
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                appended_at: message.timestamp().to_millis().unwrap_or_default(),
            }),
        };
        match received {
            Ok(record) => {
                self.next = record.offset + 1;
                Ok(Some(record))
            }
            Err(KafkaError::MessageConsumption(
                RDKafkaErrorCode::OffsetOutOfRange | RDKafkaErrorCode::AutoOffsetReset,
            )) => Err(self.retention_exceeded()),
            Err(e) => {
                warn!(partition = self.partition, error = %e, "Error receiving message");
                Err(connection(e))
            }
        }
    }
}

impl LogReader for KafkaLogReader {
    fn partition(&self) -> u32 {
        self.partition
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn position(&self) -> u64 {
        self.next
    }

    fn seek(&mut self, offset: u64) -> Result<(), SourceError> {
        self.assign(offset)?;
        self.next = offset;
        Ok(())
    }

    async fn read_batch(
        &mut self,
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<LogRecord>, SourceError> {
        let mut records = Vec::new();
        let wait = self.poll_timeout;

        // Block for the first record, then drain whatever is immediately ready.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                received = self.recv_one(wait) => {
                    if let Some(record) = received? {
                        records.push(record);
                        break;
                    }
                }
            }
        }
        let records = drain_ready(self, records, max).await?;

        debug!(
            partition = self.partition,
            group = %self.group,
            count = records.len(),
            "Consumed batch"
        );
        Ok(records)
    }
}

/// Dead-letter log backed by a Kafka topic.
pub struct KafkaDeadLetterLog {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterLog {
    pub fn new(config: &KafkaOptions, topic: &str) -> Result<Self, SourceError> {
        let producer: FutureProducer = client_config(config)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(connection)?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

impl DeadLetterLog for KafkaDeadLetterLog {
    fn append<'a>(
        &'a self,
        record: &'a DeadLetterRecord,
    ) -> futures::future::BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(record)?;
            let key = format!("{}-{}", record.source_partition, record.source_offset);
            self.producer
                .send(
                    FutureRecord::to(&self.topic).payload(&payload).key(&key),
                    Duration::from_secs(5),
                )
                .await
                .map_err(|(e, _)| anyhow::anyhow!("dead-letter produce failed: {e}"))?;
            Ok(())
        })
    }
}

/// Checks that the topic exists and has partitions.
pub fn health_check(config: &KafkaOptions) -> Result<u32, SourceError> {
    let consumer: BaseConsumer = client_config(config).create().map_err(connection)?;
    let metadata = consumer
        .fetch_metadata(Some(&config.topic), METADATA_TIMEOUT)
        .map_err(connection)?;

    let partitions = metadata
        .topics()
        .first()
        .map(|topic| topic.partitions().len() as u32)
        .unwrap_or(0);
    if partitions == 0 {
        return Err(SourceError::Unrecoverable(
            format!("No partitions found for topic {}", config.topic).into(),
        ));
    }

    info!(
        "Health check passed for topic {} with {} partitions",
        config.topic, partitions
    );
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TEST_TOPIC: &str = "netflix-events-test";
    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn options() -> KafkaOptions {
        KafkaOptions {
            bootstrap_servers: KAFKA_BOOTSTRAP_SERVERS.to_string(),
            topic: TEST_TOPIC.to_string(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            session_timeout_ms: Some(6000),
            poll_timeout_ms: Some(1000),
        }
    }

    async fn produce_messages(count: i32) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        for i in 0..count {
            let payload = format!("message-{}", i);
            producer
                .send(
                    FutureRecord::to(TEST_TOPIC)
                        .payload(&payload)
                        .key("k")
                        .partition(0),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }
    }

    /// Replays scripted poll outcomes in order.
    struct ScriptedPoll {
        script: std::collections::VecDeque<Result<Option<LogRecord>, SourceError>>,
    }

    impl RecordPoll for ScriptedPoll {
        async fn recv_one(&mut self, _wait: Duration) -> Result<Option<LogRecord>, SourceError> {
            self.script.pop_front().unwrap_or(Ok(None))
        }
    }

    fn record(offset: u64) -> LogRecord {
        LogRecord {
            partition: 0,
            offset,
            payload: Vec::new(),
            appended_at: 0,
        }
    }

    fn broker_down() -> SourceError {
        connection(KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure))
    }

    #[tokio::test]
    async fn test_error_mid_batch_keeps_received_records() {
        let mut poller = ScriptedPoll {
            script: [Ok(Some(record(11))), Err(broker_down()), Ok(Some(record(12)))].into(),
        };
        let batch = drain_ready(&mut poller, vec![record(10)], 10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![10, 11]);

        // The next poll carries on after the last delivered record.
        let batch = drain_ready(&mut poller, Vec::new(), 10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![12]);
    }

    #[tokio::test]
    async fn test_error_before_any_record_is_returned() {
        let mut poller = ScriptedPoll {
            script: [Err(broker_down())].into(),
        };
        let err = drain_ready(&mut poller, Vec::new(), 10).await.unwrap_err();
        assert!(matches!(err, SourceError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_drain_stops_at_max() {
        let mut poller = ScriptedPoll {
            script: (1..10).map(|offset| Ok(Some(record(offset)))).collect(),
        };
        let batch = drain_ready(&mut poller, vec![record(0)], 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(poller.script.len(), 7);
    }

    #[tokio::test]
    #[ignore = "needs a Kafka broker on localhost:9092"]
    async fn test_reader_consumes_partition_in_order() {
        produce_messages(10).await;
        let mut reader = KafkaLogReader::new(&options(), "cg-test", 0).expect("reader");
        let cancel = CancellationToken::new();

        let mut offsets = Vec::new();
        while offsets.len() < 10 {
            let batch = reader.read_batch(4, &cancel).await.expect("batch");
            offsets.extend(batch.iter().map(|r| r.offset));
        }
        assert!(offsets.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    #[ignore = "needs a Kafka broker on localhost:9092"]
    async fn test_health_check() {
        produce_messages(1).await;
        assert!(health_check(&options()).expect("health check") > 0);
    }
}
