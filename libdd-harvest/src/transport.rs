// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    fs::OpenOptions,
    io::Write,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error};

/// Sink for harvested payloads.
///
/// The returned future resolving is the "finished sending" notification the harvester waits
/// on; an error tells the aggregator whether its events should be kept for the next cycle.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: &str, payload: &Value) -> Result<(), TransportError>;
}

/// Appends every payload as one JSON line `{"method": .., "payload": ..}` to a writer.
#[derive(Clone)]
pub struct FileTransport {
    file: Arc<Mutex<Box<dyn Write + Sync + Send>>>,
}

impl FileTransport {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        debug!(file.path = ?path, "Using file transport");
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn from_writer(writer: Box<dyn Write + Sync + Send>) -> Self {
        Self {
            file: Arc::new(Mutex::new(writer)),
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(&self, method: &str, payload: &Value) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&serde_json::json!({
            "method": method,
            "payload": payload,
        }))?;
        line.push(b'\n');

        let mut writer = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.write_all(&line).and_then(|()| writer.flush()) {
            Ok(()) => {
                debug!(method, file.bytes_written = line.len(), "Wrote payload to file");
                Ok(())
            }
            Err(e) => {
                error!(method, error = %e, "Failed to write payload to file");
                Err(e.into())
            }
        }
    }
}
