// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// # Message queue reader options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[cfg_attr(feature = "options_schema", derive(schemars::JsonSchema))]
#[cfg_attr(feature = "options_schema", schemars(rename = "ReaderOptions", default))]
#[serde(rename_all = "kebab-case")]
#[builder(default)]
pub struct ReaderOptions {
    /// # Reader name
    ///
    /// Identity of this reader. Used as the broker subscription name and as
    /// the `name` label on the reader metrics.
    pub reader_name: String,

    /// # Topic
    ///
    /// Topic to subscribe to. Defaults to `<reader-name>-message-queue`.
    topic: Option<String>,

    /// # Service URL
    ///
    /// URL of the broker to connect to.
    pub service_url: String,

    /// # Receive timeout
    ///
    /// Maximum time to wait for a single message during a batch read. When it
    /// elapses the whole batch read fails.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    #[cfg_attr(feature = "options_schema", schemars(with = "String"))]
    pub receive_timeout: humantime::Duration,
}

impl ReaderOptions {
    pub fn topic(&self) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| format!("{}-message-queue", self.reader_name))
    }

    pub fn subscription_name(&self) -> &str {
        &self.reader_name
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            reader_name: "input".to_owned(),
            topic: None,
            service_url: "pulsar://localhost:6650".to_owned(),
            receive_timeout: Duration::from_secs(5).into(),
        }
    }
}
