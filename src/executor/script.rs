//! Generated Python script: tool stubs, user code, and the RPC server.
//!
//! Rendering is a pure function of its inputs. Every template is a constant
//! with `{{PLACEHOLDER}}` slots so each piece can be inspected on its own.

/// Logged by the script once its WebSocket server is accepting connections.
pub const READY_SIGNAL: &str = "INITIALIZED SERVER";

/// Printed right before the user code starts.
pub const START_MARKER: &str = "Executing code...";

/// Printed when the user code finishes without raising.
pub const COMPLETION_MARKER: &str = "Code execution completed.";

/// Endpoint the host connects to for tool calls.
pub const TOOLS_ENDPOINT: &str = "/ws";

/// Endpoint the host connects to for workspace file transfers.
pub const FILES_ENDPOINT: &str = "/ws_files";

const INDENT: &str = "        ";

/// Top-level names the generated script defines or relies on.
///
/// A tool stub with one of these names would shadow part of the wrapper.
pub const RESERVED_GLOBALS: &[&str] = &[
    // imports
    "uvicorn", "FastAPI", "RpcMethodsBase", "WebsocketRPCEndpoint", "RpcChannel",
    "asyncio", "base64", "logging", "os", "nest_asyncio",
    // module state
    "logger", "server", "shutdown_event", "ws_channel", "files_channel",
    "WORKSPACE_SYNC", "WORKSPACE_PATH", "WORKSPACE_FILES",
    "app", "EmptyMethods", "tools_endpoint", "files_endpoint",
    // functions
    "_file_call", "load_file", "save_file", "do_work", "maybe_start_work",
    "on_tools_connect", "on_files_connect", "main",
    // builtins the wrapper and stubs call
    "print", "open", "dict", "str", "Exception", "KeyboardInterrupt",
];

const HEADER_TEMPLATE: &str = r#"
import uvicorn
from fastapi import FastAPI
from fastapi_websocket_rpc import RpcMethodsBase, WebsocketRPCEndpoint, RpcChannel
import asyncio
import base64
import logging
import os
import nest_asyncio

nest_asyncio.apply()

logger = logging.getLogger(__name__)

logging.basicConfig(level=logging.ERROR)

server: uvicorn.Server | None = None
shutdown_event = asyncio.Event()

ws_channel: RpcChannel | None = None
files_channel: RpcChannel | None = None
WORKSPACE_SYNC = {{WORKSPACE_SYNC}}
WORKSPACE_PATH = {{WORKSPACE_PATH}}
WORKSPACE_FILES = {{WORKSPACE_FILES}}
"#;

const TOOL_STUB_TEMPLATE: &str = r#"
def {{IDENT}}(args: dict = None):
    result = asyncio.run(ws_channel.call("{{IDENT}}", args=args or {}))
    call_value = result.result["value"]
    if result.result["error"]:
        raise Exception(f"Error in function call {{IDENT}}: {call_value}")
    return call_value
"#;

const FILE_HELPERS_TEMPLATE: &str = r#"
def _file_call(method: str, args: dict):
    result = asyncio.run(files_channel.call(method, args=args))
    call_value = result.result["value"]
    if result.result["error"]:
        raise Exception(f"Error in {method}: {call_value}")
    return call_value


def load_file(name: str) -> str:
    value = _file_call("load_file", {"name": name})
    directory = os.path.dirname(name)
    if directory:
        os.makedirs(directory, exist_ok=True)
    with open(name, "wb") as f:
        f.write(base64.b64decode(value["content"]))
    return name


def save_file(name: str) -> str:
    with open(name, "rb") as f:
        content = base64.b64encode(f.read()).decode("ascii")
    _file_call("save_file", {"name": name, "content": content})
    return name
"#;

const BODY_TEMPLATE: &str = r#"
async def do_work():
    try:
        print("{{START_MARKER}}", flush=True)
{{USER_CODE}}
        print("{{COMPLETION_MARKER}}", flush=True)
        pass
    except Exception as e:
        print(f"Error in executing code: {e}", flush=True)
    finally:
        for channel in (ws_channel, files_channel):
            if channel:
                try:
                    await channel.close()
                except Exception as e:
                    print(f"Error closing WebSocket channel: {e}", flush=True)
        shutdown_event.set()


def maybe_start_work():
    if ws_channel is not None and (not WORKSPACE_SYNC or files_channel is not None):
        asyncio.create_task(do_work())


async def on_tools_connect(channel: RpcChannel):
    global ws_channel
    if ws_channel is None:
        ws_channel = channel
        maybe_start_work()
    else:
        await channel.close()


async def on_files_connect(channel: RpcChannel):
    global files_channel
    if files_channel is None:
        files_channel = channel
        maybe_start_work()
    else:
        await channel.close()


app = FastAPI()


class EmptyMethods(RpcMethodsBase):
    pass


tools_endpoint = WebsocketRPCEndpoint(EmptyMethods(), on_connect=[on_tools_connect])
tools_endpoint.register_route(app, "{{TOOLS_ENDPOINT}}")

if WORKSPACE_SYNC:
    files_endpoint = WebsocketRPCEndpoint(EmptyMethods(), on_connect=[on_files_connect])
    files_endpoint.register_route(app, "{{FILES_ENDPOINT}}")


async def main():
    logging.getLogger("fastapi_ws_rpc").setLevel(logging.WARNING)
    global server
    config = uvicorn.Config(
        app=app,
        host="{{BIND_HOST}}",
        port={{PORT}},
        log_level="warning",
        ws_max_size=16 * 1024 * 1024,
    )
    server = uvicorn.Server(config)

    serve_task = asyncio.create_task(server.serve())
    while not server.started:
        await asyncio.sleep(0.01)
    logging.getLogger().setLevel(logging.INFO)
    logger.info("{{READY_SIGNAL}}")

    await shutdown_event.wait()

    server.should_exit = True
    await asyncio.sleep(0.1)
    await serve_task


if __name__ == "__main__":
    try:
        asyncio.run(main())
    except KeyboardInterrupt:
        print("Shutdown requested by user (Ctrl+C).")
"#;

/// Workspace details baked into the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptWorkspace {
    /// Directory the code sees as its workspace
    pub path: Option<String>,
    /// Files available through `load_file`; `Some` enables the second endpoint
    pub files: Option<Vec<String>>,
}

/// Everything the script template depends on.
#[derive(Debug, Clone)]
pub struct ScriptParams<'a> {
    pub port: u16,
    /// Interface the RPC server listens on
    pub bind_host: &'a str,
    pub tool_identifiers: &'a [String],
    pub user_code: &'a str,
    pub workspace: ScriptWorkspace,
}

/// Render the runnable script.
pub fn render(params: &ScriptParams<'_>) -> String {
    let sync = params.workspace.files.is_some();

    let header = HEADER_TEMPLATE
        .replace("{{WORKSPACE_SYNC}}", if sync { "True" } else { "False" })
        .replace(
            "{{WORKSPACE_PATH}}",
            &params
                .workspace
                .path
                .as_deref()
                .map(python_string)
                .unwrap_or_else(|| "None".to_string()),
        )
        .replace(
            "{{WORKSPACE_FILES}}",
            &python_string_list(params.workspace.files.as_deref().unwrap_or(&[])),
        );

    let stubs: String = params
        .tool_identifiers
        .iter()
        .map(|ident| render_tool_stub(ident))
        .collect::<Vec<_>>()
        .join("\n");

    // Substitute user code last so placeholder-looking text inside it stays untouched.
    let body = BODY_TEMPLATE
        .replace("{{START_MARKER}}", START_MARKER)
        .replace("{{COMPLETION_MARKER}}", COMPLETION_MARKER)
        .replace("{{TOOLS_ENDPOINT}}", TOOLS_ENDPOINT)
        .replace("{{FILES_ENDPOINT}}", FILES_ENDPOINT)
        .replace("{{PORT}}", &params.port.to_string())
        .replace("{{BIND_HOST}}", params.bind_host)
        .replace("{{READY_SIGNAL}}", READY_SIGNAL)
        .replace("{{USER_CODE}}", &indent_code(params.user_code, INDENT));

    let mut script = header;
    script.push_str(&stubs);
    if sync {
        script.push_str(FILE_HELPERS_TEMPLATE);
    }
    script.push_str(&body);
    script
}

/// Stub for one tool. `ident` must already be a sanitized identifier.
pub fn render_tool_stub(ident: &str) -> String {
    TOOL_STUB_TEMPLATE.replace("{{IDENT}}", ident)
}

/// Indent user code into the `try` block.
///
/// Lines inside a triple-quoted string literal are left alone so the
/// literal's content is unchanged; lines carrying the delimiter itself are
/// indented so the statement stays in the block. A closing delimiter on its
/// own line therefore adds `prefix` to the end of the literal's value.
pub fn indent_code(code: &str, prefix: &str) -> String {
    let mut in_literal = false;
    code.split('\n')
        .map(|line| {
            let delimiters = line.matches("\"\"\"").count() + line.matches("'''").count();
            if delimiters > 0 {
                if delimiters % 2 == 1 {
                    in_literal = !in_literal;
                }
                format!("{}{}", prefix, line)
            } else if in_literal {
                line.to_string()
            } else {
                format!("{}{}", prefix, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove the wrapper's own start/completion lines from console output.
pub fn strip_wrapper_markers(output: &str) -> String {
    output
        .split_inclusive('\n')
        .filter(|line| {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            trimmed != START_MARKER && trimmed != COMPLETION_MARKER
        })
        .collect()
}

fn python_string(value: &str) -> String {
    // JSON string literals are valid Python string literals.
    serde_json::Value::String(value.to_string()).to_string()
}

fn python_string_list(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| python_string(v)).collect();
    format!("[{}]", items.join(", "))
}
