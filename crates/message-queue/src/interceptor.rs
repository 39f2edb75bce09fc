// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{counter, Counter};

use crate::entry::{AckToken, Entry};
use crate::metric_definitions::{READER_BYTES, READER_BYTE_COUNT, READER_MESSAGES};

/// Acknowledgment outcome notification.
///
/// Only `Acknowledged` is emitted by the reader today; the remaining variants
/// are extension points for broker clients that batch or time out
/// acknowledgments (e.g. to drive dead-lettering policy).
#[derive(Debug, Clone)]
pub enum AckEvent {
    Acknowledged(AckToken),
    CumulativeAcknowledged(AckToken),
    NegativeAcksSent(Vec<AckToken>),
    AckTimeout(Vec<AckToken>),
}

/// Hook observing every message as it crosses the reader boundary.
///
/// `before_consume` is invoked exactly once per message, immediately after
/// receipt and before the entry is appended to the caller's batch. The entry
/// is handed to the caller unchanged.
pub trait ConsumerInterceptor: Send + Sync {
    fn before_consume(&self, entry: &Entry);

    fn on_ack_event(&self, _event: AckEvent) {}
}

/// Built-in interceptor keeping the reader throughput metrics.
pub struct MetricsInterceptor {
    messages: Counter,
    byte_count: Counter,
    bytes: Counter,
}

impl MetricsInterceptor {
    pub fn new(reader_name: &str) -> Self {
        Self {
            messages: counter!(READER_MESSAGES, "name" => reader_name.to_owned()),
            byte_count: counter!(READER_BYTE_COUNT, "name" => reader_name.to_owned()),
            bytes: counter!(READER_BYTES, "name" => reader_name.to_owned()),
        }
    }
}

impl ConsumerInterceptor for MetricsInterceptor {
    fn before_consume(&self, entry: &Entry) {
        let length = entry.value().len() as u64;

        self.messages.increment(1);
        self.byte_count.increment(length);
        self.bytes.increment(length);
    }
}
