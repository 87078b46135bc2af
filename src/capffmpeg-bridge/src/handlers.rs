//! Per-method adapters: read options off the call, run the core, build the
//! response. Handlers never fail; every error becomes a rejection.

use crate::plugin::FfmpegPlugin;
use crate::protocol::{CallOutcome, CallRejection, CallResponse, PluginCall};
use capffmpeg_core::{echo, ReencodeRequest, PLUGIN_VERSION};
use serde::Serialize;

pub const VERSION_ERROR: &str = "Could not get plugin version";

pub fn handle_echo(_plugin: &FfmpegPlugin, call: &PluginCall) -> CallOutcome {
    let value = call.get_string("value").map(str::to_string);

    let mut ret = CallResponse::new();
    ret.put("value", echo(value));
    CallOutcome::resolve(ret)
}

pub fn handle_get_version(_plugin: &FfmpegPlugin, _call: &PluginCall) -> CallOutcome {
    version_response(PLUGIN_VERSION)
}

/// Builds `{ version }`. A value that cannot be serialized turns into a
/// rejection carrying the fault as detail.
pub fn version_response<V: Serialize + ?Sized>(version: &V) -> CallOutcome {
    let mut ret = CallResponse::new();
    match ret.try_put("version", version) {
        Ok(_) => CallOutcome::resolve(ret),
        Err(err) => {
            tracing::error!(error = %err, "{VERSION_ERROR}");
            CallOutcome::Rejected(CallRejection::with_detail(VERSION_ERROR, err))
        }
    }
}

pub fn handle_reencode_video(plugin: &FfmpegPlugin, call: &PluginCall) -> CallOutcome {
    let request = match reencode_request(call) {
        Ok(request) => request,
        Err(message) => return CallOutcome::reject(message),
    };

    match plugin.reencode_video(&request) {
        Ok(file_id) => {
            let mut ret = CallResponse::new();
            ret.put("fileId", file_id);
            CallOutcome::resolve(ret)
        }
        Err(err) => {
            tracing::warn!(error = %err, "Rejecting re-encode request");
            CallOutcome::reject(err.to_string())
        }
    }
}

fn reencode_request(call: &PluginCall) -> Result<ReencodeRequest, String> {
    let input_path = call
        .get_string("inputPath")
        .ok_or("Input path is required")?;
    let output_path = call
        .get_string("outputPath")
        .ok_or("Output path is required")?;
    let height = call.get_int("height").ok_or("Height is required")?;
    let width = call.get_int("width").ok_or("Width is required")?;
    // 0 selects the default bitrate.
    let bitrate = call.get_int_or("bitrate", 0);

    let max = i64::from(i32::MAX);
    if !(1..=max).contains(&height) {
        return Err(format!("Height must be between 0 and {max}"));
    }
    if !(1..=max).contains(&width) {
        return Err(format!("Width must be between 0 and {max}"));
    }
    if bitrate < 0 {
        return Err("Negative bitrate is illegal!".to_string());
    }

    Ok(ReencodeRequest {
        input_path: input_path.to_string(),
        output_path: output_path.to_string(),
        width: width as u32,
        height: height as u32,
        bitrate: (bitrate > 0).then_some(bitrate as u64),
    })
}
