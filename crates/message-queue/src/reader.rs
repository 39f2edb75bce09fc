// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{histogram, Histogram};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerConnection, BrokerConsumer};
use crate::entry::{AckToken, Entry};
use crate::interceptor::{AckEvent, ConsumerInterceptor, MetricsInterceptor};
use crate::metric_definitions;
use crate::options::ReaderOptions;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

/// Lifecycle-managed reader pulling batches of messages out of a broker.
///
/// Constructed once by the owning process; clones share the same underlying
/// service, so `read`/`commit` may be called concurrently from any number of
/// worker tasks while a supervisor drives `start`/`stop`.
///
/// Reads are gated behind startup: a `read` issued before `start` completes
/// waits on the state watch and is released together with all other waiters
/// by the transition out of `Starting`. A failed startup releases waiters the
/// same way; they then observe [`Error::NotRunning`] instead of hanging.
pub struct MessageQueueReader<C: BrokerClient> {
    inner: Arc<Inner<C>>,
}

impl<C: BrokerClient> Clone for MessageQueueReader<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: BrokerClient> {
    client: C,
    options: ReaderOptions,
    state: watch::Sender<ServiceState>,
    connection: RwLock<Option<C::Connection>>,
    consumer: RwLock<Option<Arc<C::Consumer>>>,
    interceptors: Vec<Arc<dyn ConsumerInterceptor>>,
    read_timer: Histogram,
}

impl<C: BrokerClient> MessageQueueReader<C> {
    pub fn new(client: C, options: ReaderOptions) -> Self {
        Self::with_interceptors(client, options, Vec::new())
    }

    /// Like [`Self::new`], with additional interceptors installed after the
    /// built-in metrics interceptor.
    pub fn with_interceptors(
        client: C,
        options: ReaderOptions,
        extra_interceptors: Vec<Arc<dyn ConsumerInterceptor>>,
    ) -> Self {
        metric_definitions::describe_metrics();

        let mut interceptors: Vec<Arc<dyn ConsumerInterceptor>> =
            vec![Arc::new(MetricsInterceptor::new(&options.reader_name))];
        interceptors.extend(extra_interceptors);

        let read_timer = histogram!(
            metric_definitions::READER_READS,
            "name" => options.reader_name.clone()
        );

        Self {
            inner: Arc::new(Inner {
                client,
                options,
                state: watch::Sender::new(ServiceState::New),
                connection: RwLock::new(None),
                consumer: RwLock::new(None),
                interceptors,
                read_timer,
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Establishes the broker connection and subscribes the consumer.
    ///
    /// On success the service transitions to `Running` and all tasks waiting
    /// in [`Self::read`] are released. On failure it transitions to `Failed`,
    /// which releases waiters as well; they observe [`Error::NotRunning`].
    pub async fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;

        let starting = inner.state.send_if_modified(|state| {
            if *state == ServiceState::New {
                *state = ServiceState::Starting;
                true
            } else {
                false
            }
        });
        if !starting {
            return Err(Error::AlreadyStarted(*inner.state.borrow()));
        }

        info!(reader = %inner.options.reader_name, "Starting message queue reader");
        match self.establish().await {
            Ok(()) => {
                inner.state.send_replace(ServiceState::Running);
                Ok(())
            }
            Err(cause) => {
                inner.state.send_replace(ServiceState::Failed);
                Err(Error::Startup(cause))
            }
        }
    }

    async fn establish(&self) -> Result<(), anyhow::Error> {
        let inner = &self.inner;

        let connection = inner
            .client
            .connect(&inner.options.service_url)
            .await
            .map_err(anyhow::Error::new)?;
        let consumer = connection
            .subscribe(&inner.options.topic(), inner.options.subscription_name())
            .await
            .map_err(anyhow::Error::new)?;
        debug!(
            reader = %inner.options.reader_name,
            topic = %inner.options.topic(),
            "Subscribed to broker topic"
        );

        *inner.connection.write() = Some(connection);
        *inner.consumer.write() = Some(Arc::new(consumer));
        Ok(())
    }

    /// Closes the consumer and the broker connection, in that order.
    ///
    /// Idempotent: stopping an already stopped reader (or one that never
    /// acquired its resources) is a no-op. A close failure is surfaced but
    /// does not prevent closing the remaining resource.
    pub async fn stop(&self) -> Result<(), Error> {
        let inner = &self.inner;

        let stopping = inner.state.send_if_modified(|state| match state {
            ServiceState::Stopping | ServiceState::Terminated => false,
            _ => {
                *state = ServiceState::Stopping;
                true
            }
        });
        if !stopping {
            return Ok(());
        }

        info!(reader = %inner.options.reader_name, "Stopping message queue reader");
        let mut first_failure = None;

        let consumer = inner.consumer.write().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.close().await {
                warn!(reader = %inner.options.reader_name, error = %e, "Failed to close broker consumer");
                first_failure.get_or_insert_with(|| anyhow::Error::new(e));
            }
        }

        let connection = inner.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(reader = %inner.options.reader_name, error = %e, "Failed to close broker connection");
                first_failure.get_or_insert_with(|| anyhow::Error::new(e));
            }
        }

        inner.state.send_replace(ServiceState::Terminated);
        match first_failure {
            None => Ok(()),
            Some(cause) => Err(Error::Shutdown(cause)),
        }
    }

    /// Reads exactly `count` entries, in receive order.
    ///
    /// Waits for startup to complete, then issues one bounded receive per
    /// entry. The call is all-or-nothing: if any receive times out or fails,
    /// the whole call fails and the partial batch is discarded. Entries read
    /// but never committed are redelivered by the broker.
    pub async fn read(&self, count: usize) -> Result<Vec<Entry>, Error> {
        let inner = &self.inner;
        let mut entries = Vec::with_capacity(count);

        let mut state_rx = inner.state.subscribe();
        // Copy the state out so the watch guard is dropped before the receive
        // loop; holding it across an await would make this future !Send.
        let state = match state_rx
            .wait_for(|state| !matches!(state, ServiceState::New | ServiceState::Starting))
            .await
        {
            Ok(state) => *state,
            // The service went away while we were waiting for it to come up.
            // Benign early exit with whatever has been accumulated (nothing).
            Err(_) => return Ok(entries),
        };
        if state != ServiceState::Running {
            return Err(Error::NotRunning);
        }

        let Some(consumer) = inner.consumer.read().as_ref().map(Arc::clone) else {
            return Err(Error::NotRunning);
        };

        let receive_timeout: Duration = inner.options.receive_timeout.into();
        let read_start = Instant::now();
        for _ in 0..count {
            let message = match tokio::time::timeout(receive_timeout, consumer.receive()).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return Err(Error::Consume(anyhow::Error::new(e))),
                Err(_) => return Err(Error::ReceiveTimeout),
            };

            let entry = Entry::from_message(&message);
            for interceptor in &inner.interceptors {
                interceptor.before_consume(&entry);
            }
            entries.push(entry);
        }
        inner.read_timer.record(read_start.elapsed());

        Ok(entries)
    }

    /// Acknowledges exactly one previously read entry.
    ///
    /// The token must have been produced by this reader's broker client; a
    /// foreign token is rejected without contacting the broker. On success the
    /// broker will not redeliver the message to this subscription.
    pub async fn commit(&self, ack_token: &AckToken) -> Result<(), Error> {
        let inner = &self.inner;

        if *inner.state.borrow() != ServiceState::Running {
            return Err(Error::NotRunning);
        }
        let Some(ack_id) = ack_token.downcast_ref::<C::AckId>() else {
            return Err(Error::UnrecognizedToken);
        };
        let Some(consumer) = inner.consumer.read().as_ref().map(Arc::clone) else {
            return Err(Error::NotRunning);
        };

        consumer
            .acknowledge(ack_id)
            .await
            .map_err(|e| Error::Acknowledge(anyhow::Error::new(e)))?;

        for interceptor in &inner.interceptors {
            interceptor.on_ack_event(AckEvent::Acknowledged(ack_token.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use test_log::test;

    use crate::mock::{MockAckId, MockBroker, MockBrokerError};

    #[derive(Default)]
    struct RecordingInterceptor {
        seen: parking_lot::Mutex<Vec<Bytes>>,
        acks: parking_lot::Mutex<Vec<AckToken>>,
    }

    impl ConsumerInterceptor for RecordingInterceptor {
        fn before_consume(&self, entry: &Entry) {
            self.seen.lock().push(entry.value().clone());
        }

        fn on_ack_event(&self, event: AckEvent) {
            if let AckEvent::Acknowledged(token) = event {
                self.acks.lock().push(token);
            }
        }
    }

    fn reader_with_recorder(
        broker: MockBroker,
    ) -> (MessageQueueReader<MockBroker>, Arc<RecordingInterceptor>) {
        let recorder = Arc::new(RecordingInterceptor::default());
        let reader = MessageQueueReader::with_interceptors(
            broker,
            ReaderOptions::default(),
            vec![recorder.clone()],
        );
        (reader, recorder)
    }

    #[test(tokio::test)]
    async fn read_returns_exactly_requested_entries() {
        let broker = MockBroker::new();
        broker.push(Some(&b"k1"[..]), b"aaaaa"); // 5 bytes
        broker.push(None, b"bbbbbbbbbb"); // 10 bytes
        broker.push(Some(&b"k3"[..]), b"ccccccc"); // 7 bytes

        let (reader, recorder) = reader_with_recorder(broker.clone());
        reader.start().await.unwrap();
        assert_eq!(reader.state(), ServiceState::Running);

        let entries = reader.read(3).await.unwrap();

        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert!(!entry.id().is_empty());
            assert!(!entry.value().is_empty());
            assert!(entry.timestamp() > 0);
        }
        assert_eq!(entries[0].value().as_ref(), b"aaaaa");
        assert_eq!(entries[1].value().as_ref(), b"bbbbbbbbbb");
        assert_eq!(entries[2].value().as_ref(), b"ccccccc");
        assert_eq!(entries[0].key().map(|k| k.as_ref()), Some(&b"k1"[..]));
        assert_eq!(entries[1].key(), None);

        // One interceptor invocation per message, byte accounting adds up
        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.iter().map(|value| value.len()).sum::<usize>(), 22);

        // Reading does not acknowledge
        assert!(broker.acknowledged().is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn read_blocks_until_startup_completes() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());

        let read_task = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(1).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!read_task.is_finished());

        broker.push(None, b"hello");
        reader.start().await.unwrap();

        let entries = read_task.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value().as_ref(), b"hello");
    }

    #[test(tokio::test(start_paused = true))]
    async fn readiness_gate_releases_all_waiters_together() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());

        let first = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(1).await }
        });
        let second = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(1).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        broker.push(None, b"one");
        broker.push(None, b"two");
        reader.start().await.unwrap();

        let mut values: Vec<_> = [first.await, second.await]
            .into_iter()
            .map(|batch| {
                let batch = batch.unwrap().unwrap();
                assert_eq!(batch.len(), 1);
                batch[0].value().clone()
            })
            .collect();
        values.sort();
        assert_eq!(values, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[test(tokio::test)]
    async fn failed_startup_releases_readers_with_not_running() {
        let broker = MockBroker::failing_connect();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());

        let read_task = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(1).await }
        });

        let err = reader.start().await.unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
        assert_eq!(reader.state(), ServiceState::Failed);

        // The waiter is woken by the Failed transition instead of hanging
        let err = read_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotRunning));

        // A later read fails immediately as well
        let err = reader.read(1).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[test(tokio::test)]
    async fn failed_subscribe_is_a_startup_failure() {
        let broker = MockBroker::failing_subscribe();
        let reader = MessageQueueReader::new(broker, ReaderOptions::default());

        let err = reader.start().await.unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
        assert_eq!(reader.state(), ServiceState::Failed);
    }

    #[test(tokio::test)]
    async fn read_after_shutdown_fails_not_running() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());
        reader.start().await.unwrap();
        reader.stop().await.unwrap();

        let err = reader.read(1).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning));

        let err = reader
            .commit(&AckToken::new(MockAckId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[test(tokio::test(start_paused = true))]
    async fn receive_timeout_discards_partial_batch() {
        let broker = MockBroker::new();
        broker.push(None, b"only-one");

        let (reader, recorder) = reader_with_recorder(broker);
        reader.start().await.unwrap();

        // Source stalls after the first message; the second receive runs into
        // the 5s timeout and the whole call fails without a partial batch.
        let err = reader.read(2).await.unwrap_err();
        assert!(matches!(err, Error::ReceiveTimeout));

        // The first message did cross the boundary before the abort
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test(tokio::test)]
    async fn consumption_error_aborts_the_read() {
        let broker = MockBroker::new();
        broker.push(None, b"fine");
        broker.push_receive_error(MockBrokerError::Disconnected);

        let reader = MessageQueueReader::new(broker, ReaderOptions::default());
        reader.start().await.unwrap();

        let err = reader.read(2).await.unwrap_err();
        assert!(matches!(err, Error::Consume(_)));
    }

    #[test(tokio::test)]
    async fn commit_acknowledges_exactly_one_message() {
        let broker = MockBroker::new();
        let pushed = broker.push(None, b"payload");

        let (reader, recorder) = reader_with_recorder(broker.clone());
        reader.start().await.unwrap();

        let entries = reader.read(1).await.unwrap();
        reader.commit(entries[0].ack_token()).await.unwrap();

        assert_eq!(broker.acknowledged(), vec![pushed]);
        assert_eq!(recorder.acks.lock().len(), 1);
    }

    #[test(tokio::test)]
    async fn commit_rejects_foreign_token_without_broker_call() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());
        reader.start().await.unwrap();

        let err = reader
            .commit(&AckToken::new("not an ack id".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedToken));
        assert!(broker.acknowledged().is_empty());
    }

    #[test(tokio::test)]
    async fn commit_surfaces_broker_acknowledge_failure() {
        let broker = MockBroker::failing_acknowledge();
        broker.push(None, b"payload");

        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());
        reader.start().await.unwrap();

        let entries = reader.read(1).await.unwrap();
        let err = reader.commit(entries[0].ack_token()).await.unwrap_err();
        assert!(matches!(err, Error::Acknowledge(_)));
        assert!(broker.acknowledged().is_empty());
    }

    #[test(tokio::test)]
    async fn stop_closes_consumer_before_connection_and_is_idempotent() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());
        reader.start().await.unwrap();

        reader.stop().await.unwrap();
        assert_eq!(reader.state(), ServiceState::Terminated);
        assert_eq!(broker.close_order(), vec!["consumer", "connection"]);

        // Second stop is a no-op over the already closed resources
        reader.stop().await.unwrap();
        assert_eq!(broker.close_order(), vec!["consumer", "connection"]);
    }

    #[test(tokio::test)]
    async fn failed_consumer_close_still_closes_connection() {
        let broker = MockBroker::failing_consumer_close();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());
        reader.start().await.unwrap();

        // The consumer close failure is surfaced, but the connection is
        // closed regardless and the service still terminates.
        let err = reader.stop().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown(_)));
        assert_eq!(reader.state(), ServiceState::Terminated);
        assert!(!broker.consumer_closed());
        assert!(broker.connection_closed());

        // A second stop does not retry the failed close
        reader.stop().await.unwrap();
        assert_eq!(broker.close_order(), vec!["connection"]);
    }

    #[test(tokio::test)]
    async fn stop_before_start_is_a_no_op() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker.clone(), ReaderOptions::default());

        reader.stop().await.unwrap();
        assert_eq!(reader.state(), ServiceState::Terminated);
        assert!(!broker.consumer_closed());
        assert!(!broker.connection_closed());
    }

    #[test(tokio::test)]
    async fn start_twice_fails() {
        let broker = MockBroker::new();
        let reader = MessageQueueReader::new(broker, ReaderOptions::default());
        reader.start().await.unwrap();

        let err = reader.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyStarted(ServiceState::Running)
        ));
    }
}
