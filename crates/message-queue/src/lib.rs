// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Broker-agnostic message queue consumption.
//!
//! This crate pulls batches of messages out of an external pub/sub broker
//! through a uniform interface: batch reads with a per-message receive
//! timeout, explicit per-message acknowledgment, and service-style lifecycle
//! control. The broker itself is an external collaborator behind the
//! [`BrokerClient`] trait family; message payloads are opaque byte sequences.
//!
//! Delivery is at-least-once: an entry that is read but never committed will
//! be redelivered by the broker.

mod entry;
mod interceptor;
mod metric_definitions;
mod options;
mod reader;

pub mod broker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use broker::{BrokerClient, BrokerConnection, BrokerConsumer, BrokerMessage};
pub use entry::{AckToken, Entry};
pub use interceptor::{AckEvent, ConsumerInterceptor, MetricsInterceptor};
pub use options::{ReaderOptions, ReaderOptionsBuilder};
pub use reader::{MessageQueueReader, ServiceState};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message queue service is not running")]
    NotRunning,
    #[error("message queue reader was already started (state: {0})")]
    AlreadyStarted(ServiceState),
    #[error("error setting up the broker connection")]
    Startup(#[source] anyhow::Error),
    #[error("error tearing down the broker connection")]
    Shutdown(#[source] anyhow::Error),
    #[error("timeout waiting for messages")]
    ReceiveTimeout,
    #[error("error consuming messages")]
    Consume(#[source] anyhow::Error),
    #[error("could not acknowledge message")]
    Acknowledge(#[source] anyhow::Error),
    #[error("could not acknowledge message, unrecognized ack token type")]
    UnrecognizedToken,
}
