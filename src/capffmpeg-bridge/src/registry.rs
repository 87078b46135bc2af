//! Registration table handed to the host at load time.

use crate::handlers::{handle_echo, handle_get_version, handle_reencode_video};
use crate::plugin::FfmpegPlugin;
use crate::protocol::{CallOutcome, PluginCall};
use capffmpeg_core::{PLUGIN_IDENTIFIER, PLUGIN_NAME};
use serde::Serialize;

pub type MethodHandler = fn(&FfmpegPlugin, &PluginCall) -> CallOutcome;

/// How the host should hand the result back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    Promise,
}

#[derive(Clone)]
pub struct PluginMethod {
    pub name: &'static str,
    pub return_type: ReturnType,
    pub handler: MethodHandler,
}

impl std::fmt::Debug for PluginMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMethod")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

/// Host-facing description of the plugin plus its dispatch table.
#[derive(Debug, Clone)]
pub struct PluginRegistration {
    pub js_name: &'static str,
    pub identifier: &'static str,
    methods: Vec<PluginMethod>,
}

impl PluginRegistration {
    /// The table for this plugin.
    pub fn ffmpeg() -> Self {
        Self {
            js_name: PLUGIN_NAME,
            identifier: PLUGIN_IDENTIFIER,
            methods: vec![
                PluginMethod {
                    name: "echo",
                    return_type: ReturnType::Promise,
                    handler: handle_echo,
                },
                PluginMethod {
                    name: "getPluginVersion",
                    return_type: ReturnType::Promise,
                    handler: handle_get_version,
                },
                PluginMethod {
                    name: "reencodeVideo",
                    return_type: ReturnType::Promise,
                    handler: handle_reencode_video,
                },
            ],
        }
    }

    pub fn methods(&self) -> &[PluginMethod] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&PluginMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn dispatch(&self, plugin: &FfmpegPlugin, call: &PluginCall) -> CallOutcome {
        let Some(method) = self.method(&call.method) else {
            tracing::warn!(method = %call.method, plugin = self.js_name, "Unknown method");
            return CallOutcome::reject(format!("Method {} not implemented", call.method));
        };

        tracing::debug!(method = method.name, id = call.id, "Dispatching call");
        let outcome = (method.handler)(plugin, call);
        if let Some(rejection) = outcome.rejection() {
            tracing::debug!(
                method = method.name,
                id = call.id,
                message = %rejection.message,
                "Call rejected"
            );
        }
        outcome
    }
}
