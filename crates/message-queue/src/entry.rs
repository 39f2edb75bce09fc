// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::broker::BrokerMessage;

/// Opaque handle acknowledging exactly one message.
///
/// Wraps the broker-native message identifier. The reader downcasts it back
/// to the broker client's `AckId` type on commit; a token that was not
/// produced by the same broker client fails the downcast and is rejected
/// before the broker is contacted.
#[derive(Clone)]
pub struct AckToken(Arc<dyn Any + Send + Sync>);

impl AckToken {
    pub fn new<T: Any + Send + Sync>(ack_id: T) -> Self {
        Self(Arc::new(ack_id))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AckToken").field(&self.0.type_id()).finish()
    }
}

/// One consumed message in its normalized representation.
///
/// Created only by translating a broker-native message; immutable afterwards.
/// The reader holds no ownership of entries once they are returned — an entry
/// that is never committed will be redelivered by the broker.
#[derive(Debug, Clone)]
pub struct Entry {
    id: Bytes,
    key: Option<Bytes>,
    value: Bytes,
    timestamp: i64,
    ack_token: AckToken,
}

impl Entry {
    pub(crate) fn from_message<M>(message: &M) -> Self
    where
        M: BrokerMessage,
        M::AckId: Any + Send + Sync,
    {
        Self {
            id: message.id(),
            key: message.key(),
            value: message.payload(),
            timestamp: message.publish_time(),
            ack_token: AckToken::new(message.ack_id()),
        }
    }

    /// Broker-assigned identifier. Never empty.
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Publish time in milliseconds since the unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Token to pass to `commit` to acknowledge this entry.
    pub fn ack_token(&self) -> &AckToken {
        &self.ack_token
    }
}
