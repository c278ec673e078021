//! The `runPythonScript` tool: loops, conditionals, and batching over the
//! device tools without a round trip to the MCP client per call.
//!
//! The user script runs under `python3` behind a generated prelude that
//! exposes every manifest tool as `tools.<name>(...)`. Each trampoline POSTs
//! back into this daemon's own `/mcp` endpoint, so scripted calls serialize
//! through the same transactor as direct ones.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use mculink_manifest::Manifest;
use serde_json::{json, Value};
use tempfile::Builder;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, error};

use crate::rpc::{error_codes, JsonRpcResponse};

pub const TOOL_NAME: &str = "runPythonScript";

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 300;

const PRELUDE_TEMPLATE: &str = include_str!("resources/python_prelude.py.tmpl");

/// The MCP tool listing entry.
pub fn tool_info() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Execute a Python 3 script with access to the device tools. \
            Use this when you need loops, conditionals, or batching across several \
            tool invocations. Inside the script call tools as `tools.NAME(arg=value, ...)`; \
            the combined console output is returned as text.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "script": {
                    "type": "string",
                    "description": "Python 3 source code to execute. Call device tools \
                        through the provided `tools` namespace."
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_TIMEOUT_SECS,
                    "default": DEFAULT_TIMEOUT_SECS,
                    "description": "Timeout in seconds."
                }
            },
            "required": ["script"]
        },
    })
}

pub async fn handle_call(
    id: Option<Value>,
    arguments: &Value,
    manifest: &Manifest,
    endpoint: &str,
) -> JsonRpcResponse {
    let Some(script) = arguments.get("script").and_then(Value::as_str) else {
        return JsonRpcResponse::error(
            id,
            error_codes::INVALID_PARAMS,
            "missing required argument 'script' (string)",
        );
    };

    let timeout = match parse_timeout(arguments) {
        Ok(timeout) => timeout,
        Err(message) => return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, message),
    };

    let mut tool_names: Vec<String> = manifest.tools.iter().map(|t| t.name.clone()).collect();
    tool_names.push(TOOL_NAME.to_string());

    match run_python_script(script, timeout, &tool_names, endpoint).await {
        Ok(output) => JsonRpcResponse::success(
            id,
            json!({ "content": [{ "type": "text", "text": output }] }),
        ),
        Err(e) => {
            error!(error = %format!("{e:#}"), "script execution failed");
            JsonRpcResponse::error(
                id,
                error_codes::INTERNAL_ERROR,
                format!("script execution failed: {e:#}"),
            )
        }
    }
}

/// The `timeout` argument must be an integer in `1..=300` seconds.
fn parse_timeout(arguments: &Value) -> Result<Duration, String> {
    match arguments.get("timeout") {
        None => Ok(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        Some(value) => {
            let secs = value
                .as_u64()
                .ok_or_else(|| "argument 'timeout' must be an integer number of seconds".to_string())?;
            if secs == 0 {
                return Err("argument 'timeout' must be at least 1 second".to_string());
            }
            if secs > MAX_TIMEOUT_SECS {
                return Err(format!(
                    "argument 'timeout' cannot exceed {MAX_TIMEOUT_SECS} seconds"
                ));
            }
            Ok(Duration::from_secs(secs))
        }
    }
}

async fn run_python_script(
    script: &str,
    timeout: Duration,
    tool_names: &[String],
    endpoint: &str,
) -> Result<String> {
    if script.trim().is_empty() {
        return Err(anyhow!("script must not be empty"));
    }

    let mut source = build_prelude(tool_names, endpoint);
    source.push_str("\n# --- user script ---\n");
    source.push_str(script);
    if !script.ends_with('\n') {
        source.push('\n');
    }

    let mut temp_file = Builder::new()
        .prefix("mculink-script-")
        .suffix(".py")
        .tempfile()
        .context("create temporary script file")?;
    temp_file
        .write_all(source.as_bytes())
        .context("write temporary script file")?;
    let temp_path = temp_file.into_temp_path();
    let script_path: PathBuf = temp_path.to_path_buf();

    debug!(path = %script_path.display(), timeout_secs = timeout.as_secs(), "running script");

    let mut command = Command::new("python3");
    command
        .arg(&script_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command
        .spawn()
        .context("spawn python3; is it installed and on PATH?")?;

    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.context("collect python3 output")?,
        Err(_) => {
            return Err(anyhow!(
                "script timed out after {} seconds",
                timeout.as_secs()
            ))
        }
    };
    drop(temp_path);

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        let status = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "termination by signal".to_string(),
        };
        return Err(anyhow!(
            "script failed with {status}\nstdout:\n{stdout}\nstderr:\n{stderr}"
        ));
    }

    Ok(format_console_output(stdout, stderr))
}

fn format_console_output(stdout: String, stderr: String) -> String {
    let stdout = stdout.trim_end_matches('\n');
    let stderr = stderr.trim_end_matches('\n');
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => "Script completed without console output.".to_string(),
        (false, true) => stdout.to_string(),
        (true, false) => format!("[stderr]\n{stderr}"),
        (false, false) => format!("{stdout}\n[stderr]\n{stderr}"),
    }
}

fn build_prelude(tool_names: &[String], endpoint: &str) -> String {
    // JSON string literals double as Python string literals here.
    let endpoint_literal =
        serde_json::to_string(endpoint).unwrap_or_else(|_| "\"\"".to_string());
    let trampolines = tool_names
        .iter()
        .map(|name| {
            let literal = serde_json::to_string(name).unwrap_or_else(|_| "\"\"".to_string());
            format!("setattr(tools, {literal}, _wrap_tool({literal}))")
        })
        .collect::<Vec<_>>()
        .join("\n");

    PRELUDE_TEMPLATE
        .replace("__MCP_ENDPOINT__", &endpoint_literal)
        .replace("__TOOL_TRAMPOLINES__", &trampolines)
}
