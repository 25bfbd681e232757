//! One-shot "execute this code" tool for assistants.
//!
//! Every call gets a fresh kernel, which is shut down before returning.
//! Failures are rendered into the text; the tool itself never fails.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use kernel_client_core::{ImageKey, OutputItem, ServerConfig, SessionError, SessionOptions};
use kernel_client_session::SessionClient;
use kernel_client_transport::ConnectivityMonitor;
use serde_json::{Value, json};

pub const TOOL_NAME: &str = "execute_python_code";

pub const TOOL_DESCRIPTION: &str = "Execute Python code in a Jupyter kernel";

/// JSON schema of the tool's parameters.
#[must_use]
pub fn tool_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "code": {
                "type": "string",
                "description": "The Python code to execute",
            },
        },
        "required": ["code"],
    })
}

/// Text rendering of a run plus the images it references.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// One line per output item; images appear as `<img src="{key}.png" />`.
    pub text: String,
    /// Base64 PNG payloads by key.
    pub images: HashMap<ImageKey, Arc<str>>,
}

/// Run `code` on a fresh kernel of the server in `config`.
///
/// `connectivity` is refreshed after the kernel is created and after it is
/// shut down, so kernel counts shown elsewhere stay current.
pub async fn run_code_once(
    config: &ServerConfig,
    code: &str,
    connectivity: Option<&ConnectivityMonitor>,
) -> ToolOutput {
    match SessionClient::new(config.clone(), SessionOptions::default()) {
        Ok(client) => run_code_with(client, code, connectivity).await,
        Err(e) => ToolOutput {
            text: format!("Code execution failed: {e}"),
            images: HashMap::new(),
        },
    }
}

/// Like [`run_code_once`] on an existing, not yet initiated client.
pub async fn run_code_with(
    client: SessionClient,
    code: &str,
    connectivity: Option<&ConnectivityMonitor>,
) -> ToolOutput {
    let items = Arc::new(Mutex::new(Vec::new()));
    let _subscription = {
        let items = Arc::clone(&items);
        client.on_output_item(move |item| {
            items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item.clone());
        })
    };

    let result = run(&client, code, connectivity).await;
    let items = std::mem::take(&mut *items.lock().unwrap_or_else(PoisonError::into_inner));

    // Collect payloads before shutdown clears the arena.
    let images = client.images(|arena| {
        items
            .iter()
            .filter_map(|item| match item {
                OutputItem::DisplayImage { key, .. } => arena.get(key).map(|p| (*key, p)),
                _ => None,
            })
            .collect()
    });

    client.shutdown().await;
    if let Some(monitor) = connectivity {
        monitor.refresh();
    }

    let mut lines: Vec<String> = items.iter().map(OutputItem::render_text).collect();
    if let Err(e) = result {
        tracing::warn!("Code execution failed: {e}");
        lines.push(format!("Code execution failed: {e}"));
    }

    ToolOutput {
        text: lines.join("\n"),
        images,
    }
}

async fn run(
    client: &SessionClient,
    code: &str,
    connectivity: Option<&ConnectivityMonitor>,
) -> Result<(), SessionError> {
    client.initiate().await?;
    if let Some(monitor) = connectivity {
        monitor.refresh();
    }
    client.run_code(code)?.finished().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use kernel_client_transport::{MemoryKernel, Step};

    use super::*;

    const PNG: &str = "iVBORw0KGgo=";

    fn client(kernel: &MemoryKernel) -> SessionClient {
        let (api, connector) = kernel.transports();
        SessionClient::with_transport(api, connector, SessionOptions::default())
    }

    #[tokio::test]
    async fn test_renders_streams_and_images() {
        let kernel = MemoryKernel::new().script(
            "plot()",
            [
                Step::stdout("hello\n"),
                Step::stderr("careful\n"),
                Step::display_png(PNG),
            ],
        );

        let output = run_code_with(client(&kernel), "plot()", None).await;

        let lines: Vec<&str> = output.text.split('\n').collect();
        assert_eq!(lines[0], "hello");
        assert_eq!(lines[2], "Error: careful");
        assert_eq!(output.images.len(), 1);
        let (key, payload) = output.images.iter().next().unwrap();
        assert_eq!(&**payload, PNG);
        assert_eq!(lines[4], format!("Image: <img src=\"{key}.png\" />"));

        // The kernel is released afterwards.
        assert_eq!(kernel.deleted(), ["kernel-1"]);
    }

    #[tokio::test]
    async fn test_exception_is_rendered_as_output() {
        let kernel = MemoryKernel::new().script(
            "1/0",
            [Step::error(
                "ZeroDivisionError",
                "division by zero",
                &["ZeroDivisionError: division by zero"],
            )],
        );

        let output = run_code_with(client(&kernel), "1/0", None).await;
        assert_eq!(output.text, "ZeroDivisionError: division by zero");
    }

    #[tokio::test]
    async fn test_connection_failure_is_rendered() {
        let kernel = MemoryKernel::new();
        kernel.fail_create();

        let output = run_code_with(client(&kernel), "print('x')", None).await;
        assert!(output.text.starts_with("Code execution failed: "));
        assert!(output.text.contains("403"));
    }

    #[tokio::test]
    async fn test_invalid_server_url_is_rendered() {
        let config = ServerConfig::new("ftp://localhost:8888", None::<String>);
        let output = run_code_once(&config, "print('x')", None).await;
        assert!(output.text.starts_with("Code execution failed: "));
    }

    #[test]
    fn test_tool_schema_requires_code() {
        assert_eq!(tool_parameters()["required"][0], "code");
    }
}
