// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Optional to have but adds description/help message to the metrics emitted to
/// the metrics' sink.
use metrics::{describe_counter, describe_histogram, Unit};

pub const READER_MESSAGES: &str = "system.message-queue.reader.messages";
pub const READER_BYTE_COUNT: &str = "system.message-queue.reader.byte-count";
pub const READER_BYTES: &str = "system.message-queue.reader.bytes";
pub const READER_READS: &str = "system.message-queue.reader.reads";

pub(crate) fn describe_metrics() {
    describe_counter!(
        READER_MESSAGES,
        Unit::Count,
        "Number of messages pulled out of the broker"
    );

    describe_counter!(
        READER_BYTE_COUNT,
        Unit::Bytes,
        "Total payload bytes pulled out of the broker"
    );

    describe_counter!(
        READER_BYTES,
        Unit::Bytes,
        "Payload bytes pulled out of the broker, for rate tracking"
    );

    describe_histogram!(
        READER_READS,
        Unit::Seconds,
        "Time taken to complete a batch read"
    );
}
