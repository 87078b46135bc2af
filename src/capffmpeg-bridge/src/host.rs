//! Line host: serves the registration table over newline-delimited JSON.
//!
//! Each inbound line is a [`PluginCall`]; each outbound line is a
//! [`HostFrame`]. Events raised by running jobs are interleaved with
//! responses on the same writer.

use crate::events::PluginEvent;
use crate::plugin::FfmpegPlugin;
use crate::protocol::{CallOutcome, HostFrame, PluginCall};
use crate::registry::PluginRegistration;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from the line host itself. Bad calls are answered, not raised.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read from host: {0}")]
    Read(std::io::Error),
    #[error("failed to write to host: {0}")]
    Write(std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
}

/// Counters for one `serve` session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub calls: u64,
    pub rejected: u64,
    pub malformed: u64,
}

pub struct LineHost {
    registration: PluginRegistration,
    plugin: Arc<FfmpegPlugin>,
}

impl LineHost {
    pub fn new(registration: PluginRegistration, plugin: Arc<FfmpegPlugin>) -> Self {
        Self {
            registration,
            plugin,
        }
    }

    pub fn plugin(&self) -> &FfmpegPlugin {
        &self.plugin
    }

    /// Reads calls until EOF, then waits for scheduled jobs so their final
    /// events are written before returning.
    pub fn serve<R, W>(&self, reader: R, writer: Arc<Mutex<W>>) -> Result<ServeSummary, HostError>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let event_writer = writer.clone();
        let listener = self.plugin.add_listener(Box::new(move |event: &PluginEvent| {
            let frame = HostFrame::Event {
                event: event.name().to_string(),
                data: event.data(),
            };
            if let Err(err) = write_frame(&event_writer, &frame) {
                tracing::warn!(event = event.name(), error = %err, "Dropping event");
            }
        }));

        let result = self.read_loop(reader, &writer);
        self.plugin.wait_all();
        self.plugin.remove_listener(listener);
        result
    }

    fn read_loop<R, W>(&self, reader: R, writer: &Mutex<W>) -> Result<ServeSummary, HostError>
    where
        R: BufRead,
        W: Write,
    {
        let mut summary = ServeSummary::default();
        for line in reader.lines() {
            let line = line.map_err(HostError::Read)?;
            if line.trim().is_empty() {
                continue;
            }

            // Held until the response is written: a job's events must not
            // reach the host before the fileId they refer to.
            let mut out = writer.lock().unwrap();
            let (id, outcome) = match serde_json::from_str::<PluginCall>(&line) {
                Ok(call) => {
                    summary.calls += 1;
                    (call.id, self.registration.dispatch(&self.plugin, &call))
                }
                Err(err) => {
                    summary.malformed += 1;
                    tracing::warn!(error = %err, "Malformed call");
                    (0, CallOutcome::reject(format!("Malformed call: {err}")))
                }
            };
            if !outcome.is_resolved() {
                summary.rejected += 1;
            }

            write_line(&mut *out, &HostFrame::Response { id, outcome })?;
        }

        tracing::info!(
            calls = summary.calls,
            rejected = summary.rejected,
            malformed = summary.malformed,
            "Host closed input"
        );
        Ok(summary)
    }
}

fn write_frame<W: Write>(writer: &Mutex<W>, frame: &HostFrame) -> Result<(), HostError> {
    let mut guard = writer.lock().unwrap();
    write_line(&mut *guard, frame)
}

fn write_line<W: Write>(out: &mut W, frame: &HostFrame) -> Result<(), HostError> {
    let json = serde_json::to_string(frame).map_err(HostError::Encode)?;
    writeln!(out, "{}", json).map_err(HostError::Write)?;
    out.flush().map_err(HostError::Write)?;
    Ok(())
}
