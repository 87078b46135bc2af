//! Host bridge for the CapacitorFFmpeg plugin.
//!
//! This crate provides:
//! - A call envelope ([`PluginCall`] in, [`CallOutcome`] out) mirroring the
//!   mobile host's plugin-call object
//! - An explicit registration table mapping method names to handlers
//! - The plugin object that schedules re-encode jobs and emits events
//! - A line host serving the table over newline-delimited JSON
//!
//! # Methods
//!
//! | method             | options                                                  | resolves with  |
//! |--------------------|----------------------------------------------------------|----------------|
//! | `echo`             | `value?: string`                                         | `{ value }`    |
//! | `getPluginVersion` | none                                                     | `{ version }`  |
//! | `reencodeVideo`    | `inputPath, outputPath: string`, `width, height, bitrate?: int` | `{ fileId }` |
//!
//! # Line protocol
//!
//! ```text
//! -> {"id":1,"method":"echo","options":{"value":"hello"}}
//! <- {"type":"response","id":1,"outcome":{"status":"resolved","data":{"value":"hello"}}}
//! -> {"id":2,"method":"reencodeVideo","options":{"inputPath":"in.mov","outputPath":"out.mp4","width":960,"height":540}}
//! <- {"type":"response","id":2,"outcome":{"status":"resolved","data":{"fileId":"job-1"}}}
//! <- {"type":"event","event":"progress","data":{"progress":0.5,"fileId":"job-1"}}
//! <- {"type":"event","event":"reencodeFinished","data":{"fileId":"job-1","state":"completed"}}
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use capffmpeg_bridge::{FfmpegPlugin, PluginCall, PluginRegistration};
//! use capffmpeg_engine::NullMediaEngine;
//! use std::sync::Arc;
//!
//! let plugin = FfmpegPlugin::new(Arc::new(NullMediaEngine::default()), Default::default())?;
//! let table = PluginRegistration::ffmpeg();
//! let outcome = table.dispatch(&plugin, &PluginCall::new("getPluginVersion"));
//! ```

mod handlers;
mod host;
mod plugin;
mod registry;

pub mod events;
pub mod protocol;

pub use events::{JobState, ListenerId, PluginEvent};
pub use handlers::{version_response, VERSION_ERROR};
pub use host::{HostError, LineHost, ServeSummary};
pub use plugin::{BridgeError, FfmpegPlugin};
pub use protocol::{CallOutcome, CallRejection, CallResponse, HostFrame, PluginCall};
pub use registry::{MethodHandler, PluginMethod, PluginRegistration, ReturnType};
