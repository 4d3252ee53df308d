//! Bounded tool-call loop
//!
//! The request/execute/respond cycle shared by every tool-capable stage.
//! Capped at two tool-invocation rounds; a single tool failure is fed
//! back to the model as error text, never raised.

use crate::llm::{ChatMessage, CompletionBackend, CompletionRequest, ToolCallRequest};
use crate::tools::ToolRegistry;
use crate::Result;
use serde_json::Value;
use tracing::{debug, warn};

/// Maximum tool-invocation rounds per loop invocation.
pub const MAX_TOOL_ROUNDS: usize = 2;

/// Drive one completion-with-tools exchange to a final text answer.
///
/// If the round cap is reached with outstanding tool calls, one final
/// completion call is made without tool access and its text is returned.
pub async fn run_tool_loop(
    backend: &dyn CompletionBackend,
    registry: &ToolRegistry,
    mut messages: Vec<ChatMessage>,
    temperature: f32,
) -> Result<String> {
    for round in 0..MAX_TOOL_ROUNDS {
        let request = CompletionRequest::new(messages.clone())
            .with_tools(registry.specs())
            .with_temperature(temperature);

        let response = backend.complete(request).await?;

        if response.tool_calls.is_empty() {
            return Ok(response.text_content());
        }

        debug!(
            round = round + 1,
            call_count = response.tool_calls.len(),
            "Executing requested tool calls"
        );

        messages.push(ChatMessage::assistant_tool_calls(
            response.text_content(),
            response.tool_calls.clone(),
        ));

        for call in &response.tool_calls {
            let result_text = execute_tool_call(registry, call).await;
            messages.push(ChatMessage::tool_result(&call.id, result_text));
        }
    }

    // Cap reached: close out without tool access.
    let final_response = backend
        .complete(CompletionRequest::new(messages).with_temperature(temperature))
        .await?;

    Ok(final_response.text_content())
}

/// Execute one requested invocation; every failure becomes result text.
async fn execute_tool_call(registry: &ToolRegistry, call: &ToolCallRequest) -> String {
    let name = &call.function.name;

    let Some(tool) = registry.get(name) else {
        warn!(tool_name = %name, "Requested tool is not registered");
        return format!("Function not found: {}", name);
    };

    let arguments: Value = match serde_json::from_str(&call.function.arguments) {
        Ok(value) => value,
        Err(e) => return format!("Invalid tool arguments: {}", e),
    };

    debug!(tool_name = %name, "Tool call");

    match tool.execute(&arguments).await {
        Ok(result) => result,
        Err(e) => format!("Execution Error: {}", e),
    }
}
