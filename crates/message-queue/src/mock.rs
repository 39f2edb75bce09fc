// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory broker for tests.
//!
//! Messages pushed through the [`MockBroker`] handle are delivered to the
//! consumer in push order; a consumer with no pushed messages pends forever,
//! which is what the reader's receive timeout is measured against.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::broker::{BrokerClient, BrokerConnection, BrokerConsumer, BrokerMessage};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockAckId(pub u64);

#[derive(Debug, Clone)]
pub struct MockMessage {
    id: Bytes,
    key: Option<Bytes>,
    payload: Bytes,
    publish_time: i64,
    ack_id: MockAckId,
}

impl BrokerMessage for MockMessage {
    type AckId = MockAckId;

    fn ack_id(&self) -> MockAckId {
        self.ack_id.clone()
    }

    fn id(&self) -> Bytes {
        self.id.clone()
    }

    fn key(&self) -> Option<Bytes> {
        self.key.clone()
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    fn publish_time(&self) -> i64 {
        self.publish_time
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MockBrokerError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("subscribe rejected")]
    SubscribeRejected,
    #[error("broker disconnected")]
    Disconnected,
    #[error("acknowledge rejected")]
    AcknowledgeRejected,
    #[error("close rejected")]
    CloseRejected,
}

#[derive(Debug, Default)]
struct Failures {
    connect: bool,
    subscribe: bool,
    acknowledge: bool,
    consumer_close: bool,
}

struct Shared {
    receive_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<MockMessage, MockBrokerError>>>,
    acknowledged: parking_lot::Mutex<Vec<MockAckId>>,
    closed: parking_lot::Mutex<Vec<&'static str>>,
    failures: Failures,
    consumer_closed: AtomicBool,
    connection_closed: AtomicBool,
}

/// Handle shared between the test and the reader under test. All clones see
/// the same queue and acknowledgment log.
#[derive(Clone)]
pub struct MockBroker {
    receive_tx: mpsc::UnboundedSender<Result<MockMessage, MockBrokerError>>,
    shared: Arc<Shared>,
    next_message_id: Arc<AtomicU64>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_failures(Failures::default())
    }

    pub fn failing_connect() -> Self {
        Self::with_failures(Failures {
            connect: true,
            ..Failures::default()
        })
    }

    pub fn failing_subscribe() -> Self {
        Self::with_failures(Failures {
            subscribe: true,
            ..Failures::default()
        })
    }

    pub fn failing_acknowledge() -> Self {
        Self::with_failures(Failures {
            acknowledge: true,
            ..Failures::default()
        })
    }

    pub fn failing_consumer_close() -> Self {
        Self::with_failures(Failures {
            consumer_close: true,
            ..Failures::default()
        })
    }

    fn with_failures(failures: Failures) -> Self {
        let (receive_tx, receive_rx) = mpsc::unbounded_channel();
        Self {
            receive_tx,
            shared: Arc::new(Shared {
                receive_rx: tokio::sync::Mutex::new(receive_rx),
                acknowledged: parking_lot::Mutex::new(Vec::new()),
                closed: parking_lot::Mutex::new(Vec::new()),
                failures,
                consumer_closed: AtomicBool::new(false),
                connection_closed: AtomicBool::new(false),
            }),
            next_message_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish a message, returning the ack id the broker assigned to it.
    pub fn push(&self, key: Option<&[u8]>, payload: &[u8]) -> MockAckId {
        let sequence = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let ack_id = MockAckId(sequence);
        let message = MockMessage {
            id: Bytes::copy_from_slice(&sequence.to_be_bytes()),
            key: key.map(Bytes::copy_from_slice),
            payload: Bytes::copy_from_slice(payload),
            publish_time: now_millis(),
            ack_id: ack_id.clone(),
        };
        let _ = self.receive_tx.send(Ok(message));
        ack_id
    }

    /// Make the next receive fail with the given error.
    pub fn push_receive_error(&self, error: MockBrokerError) {
        let _ = self.receive_tx.send(Err(error));
    }

    pub fn acknowledged(&self) -> Vec<MockAckId> {
        self.shared.acknowledged.lock().clone()
    }

    pub fn consumer_closed(&self) -> bool {
        self.shared.consumer_closed.load(Ordering::Acquire)
    }

    pub fn connection_closed(&self) -> bool {
        self.shared.connection_closed.load(Ordering::Acquire)
    }

    /// Resource close order, as `"consumer"`/`"connection"` markers.
    pub fn close_order(&self) -> Vec<&'static str> {
        self.shared.closed.lock().clone()
    }
}

pub struct MockConnection {
    shared: Arc<Shared>,
}

pub struct MockConsumer {
    shared: Arc<Shared>,
}

impl BrokerClient for MockBroker {
    type AckId = MockAckId;
    type Message = MockMessage;
    type Consumer = MockConsumer;
    type Connection = MockConnection;
    type Error = MockBrokerError;

    async fn connect(&self, _service_url: &str) -> Result<MockConnection, MockBrokerError> {
        if self.shared.failures.connect {
            return Err(MockBrokerError::ConnectionRefused);
        }
        Ok(MockConnection {
            shared: Arc::clone(&self.shared),
        })
    }
}

impl BrokerConnection for MockConnection {
    type Consumer = MockConsumer;
    type Error = MockBrokerError;

    async fn subscribe(
        &self,
        _topic: &str,
        _subscription_name: &str,
    ) -> Result<MockConsumer, MockBrokerError> {
        if self.shared.failures.subscribe {
            return Err(MockBrokerError::SubscribeRejected);
        }
        Ok(MockConsumer {
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> Result<(), MockBrokerError> {
        self.shared.connection_closed.store(true, Ordering::Release);
        self.shared.closed.lock().push("connection");
        Ok(())
    }
}

impl BrokerConsumer for MockConsumer {
    type Message = MockMessage;
    type AckId = MockAckId;
    type Error = MockBrokerError;

    async fn receive(&self) -> Result<MockMessage, MockBrokerError> {
        let mut receive_rx = self.shared.receive_rx.lock().await;
        match receive_rx.recv().await {
            Some(message) => message,
            None => Err(MockBrokerError::Disconnected),
        }
    }

    async fn acknowledge(&self, ack_id: &MockAckId) -> Result<(), MockBrokerError> {
        if self.shared.failures.acknowledge {
            return Err(MockBrokerError::AcknowledgeRejected);
        }
        self.shared.acknowledged.lock().push(ack_id.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), MockBrokerError> {
        if self.shared.failures.consumer_close {
            return Err(MockBrokerError::CloseRejected);
        }
        self.shared.consumer_closed.store(true, Ordering::Release);
        self.shared.closed.lock().push("consumer");
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
