// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The broker collaborator contract.
//!
//! A broker SDK plugs into the reader by implementing this trait family. The
//! reader only ever drives these traits; it never interprets broker-native
//! identifiers beyond storing them in [`AckToken`]s and handing them back on
//! acknowledge.
//!
//! [`AckToken`]: crate::AckToken

use std::any::Any;
use std::future::Future;

use bytes::Bytes;

/// A broker-native message, as handed back by [`BrokerConsumer::receive`].
pub trait BrokerMessage {
    /// Broker-native identifier used to acknowledge this message.
    type AckId;

    fn ack_id(&self) -> Self::AckId;

    /// Broker-assigned message identifier. Never empty.
    fn id(&self) -> Bytes;

    /// Optional partitioning/ordering key. Semantics are broker-defined.
    fn key(&self) -> Option<Bytes>;

    fn payload(&self) -> Bytes;

    /// Publish time in milliseconds since the unix epoch.
    fn publish_time(&self) -> i64;
}

/// A subscribed consumer handle.
///
/// `receive` resolves as soon as the broker delivers a message; the reader
/// bounds each receive with its configured timeout.
pub trait BrokerConsumer: Send + Sync {
    type Message;
    type AckId;
    type Error: std::error::Error + Send + Sync + 'static;

    fn receive(&self) -> impl Future<Output = Result<Self::Message, Self::Error>> + Send;

    fn acknowledge(
        &self,
        ack_id: &Self::AckId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// An established broker connection, capable of subscribing consumers.
pub trait BrokerConnection: Send + Sync {
    type Consumer;
    type Error: std::error::Error + Send + Sync + 'static;

    fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
    ) -> impl Future<Output = Result<Self::Consumer, Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Entry point of the broker collaborator.
pub trait BrokerClient: Send + Sync + 'static {
    /// Broker-native acknowledgment identifier. [`AckToken`]s are downcast to
    /// this type before the broker is contacted.
    ///
    /// [`AckToken`]: crate::AckToken
    type AckId: Any + Send + Sync;
    type Message: BrokerMessage<AckId = Self::AckId> + Send;
    type Consumer: BrokerConsumer<Message = Self::Message, AckId = Self::AckId, Error = Self::Error>
        + Send
        + Sync
        + 'static;
    type Connection: BrokerConnection<Consumer = Self::Consumer, Error = Self::Error>
        + Send
        + Sync
        + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(
        &self,
        service_url: &str,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}
