// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decodes raw listener payloads into [`Envelope`]s.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::envelope::Envelope;
use crate::errors::UnmarshalError;
use crate::instrumentation::{Context, Instrumentable, Metric};

pub struct Unmarshaller {
    cancel_token: CancellationToken,
    unmarshal_error_count: AtomicU64,
    envelopes_received: AtomicU64,
}

impl Unmarshaller {
    #[must_use]
    pub fn new(cancel_token: CancellationToken) -> Self {
        Unmarshaller {
            cancel_token,
            unmarshal_error_count: AtomicU64::new(0),
            envelopes_received: AtomicU64::new(0),
        }
    }

    pub fn unmarshal(&self, payload: &[u8]) -> Result<Envelope, UnmarshalError> {
        match serde_json::from_slice::<Envelope>(payload) {
            Ok(envelope) => {
                self.envelopes_received.fetch_add(1, Ordering::Relaxed);
                Ok(envelope)
            }
            Err(e) => {
                self.unmarshal_error_count.fetch_add(1, Ordering::Relaxed);
                error!("Error unmarshalling: {}", e);
                Err(e.into())
            }
        }
    }

    /// Decodes payloads from `input` onto `output` until the input closes, the output's receiver
    /// goes away or the cancellation token fires. Malformed payloads are counted and skipped.
    pub async fn run(&self, mut input: mpsc::Receiver<Vec<u8>>, output: mpsc::Sender<Envelope>) {
        loop {
            let payload = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!("Unmarshaller cancelled");
                    return;
                }
                next = input.recv() => match next {
                    Some(payload) => payload,
                    None => {
                        debug!("Unmarshaller input closed");
                        return;
                    }
                },
            };

            let Ok(envelope) = self.unmarshal(&payload) else {
                continue;
            };
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                sent = output.send(envelope) => if sent.is_err() {
                    debug!("Unmarshaller output closed");
                    return;
                },
            }
        }
    }
}

impl Instrumentable for Unmarshaller {
    fn emit(&self) -> Context {
        Context {
            name: "unmarshaller".to_string(),
            metrics: vec![
                Metric {
                    name: "unmarshalErrorCount",
                    value: self.unmarshal_error_count.load(Ordering::Relaxed),
                },
                Metric {
                    name: "envelopesReceived",
                    value: self.envelopes_received.load(Ordering::Relaxed),
                },
            ],
        }
    }
}
