pub mod toolbox;

use std::collections::HashMap;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolChoiceOption,
    ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    FunctionCall, FunctionObjectArgs,
};
use async_openai::Client;
use eyre::{bail, eyre, Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::RETRY_N;
use crate::journal::Journal;
use crate::validate::Success;

/// Dollars per token, `(input, output)`.
static PRICING: Lazy<HashMap<&'static str, (f64, f64)>> = Lazy::new(|| {
    const MILLION: f64 = 1_000_000.0;
    HashMap::from([
        ("gpt-4o-mini", (0.150 / MILLION, 0.600 / MILLION)),
        ("gpt-4o-mini-2024-07-18", (0.150 / MILLION, 0.600 / MILLION)),
        ("gpt-4o", (5.00 / MILLION, 15.00 / MILLION)),
        ("gpt-4o-2024-08-06", (2.50 / MILLION, 10.00 / MILLION)),
        ("gpt-4o-2024-05-13", (5.00 / MILLION, 15.00 / MILLION)),
        ("chatgpt-4o-latest", (5.00 / MILLION, 15.00 / MILLION)),
        ("gpt-4-turbo", (10.00 / MILLION, 30.00 / MILLION)),
        ("gpt-4-turbo-2024-04-09", (10.00 / MILLION, 30.00 / MILLION)),
    ])
});

/// Dollars per token of the given model, `None` if the pricing is unknown.
pub fn price_of(model: &str) -> Option<(f64, f64)> {
    PRICING.get(model).copied()
}

/// Whether the model is known to support the function calling API.
pub fn supports_function_calling(model: &str) -> bool {
    ["gpt-4", "gpt-4o", "gpt-3.5-turbo", "chatgpt-4o", "o1", "o3"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

/// One requested tool invocation; `arguments` is a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// OpenAI-format chat record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn plain(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            ..Self::default()
        }
    }

    pub fn tool(call_id: &str, name: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_call_id: Some(call_id.to_string()),
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// An explicitly registered tool: its name, human-readable description and
/// JSON-schema parameter spec.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A named set of callable tools plus the hooks around their dispatch.
pub trait Toolbox {
    fn tools(&self) -> Vec<ToolSpec>;

    /// Invoke the named tool. An `Err` is reported back to the model as a
    /// `tool`-role error message and never aborts the loop.
    fn dispatch(&mut self, name: &str, args: serde_json::Value) -> Result<serde_json::Value>;

    /// Hook before a tool call; may rewrite the arguments in place.
    fn pre_call(&mut self, _name: &str, _args: &mut serde_json::Value) {}

    /// Hook after a tool call. Returning a [`Response`] short-circuits the
    /// agent loop; its messages/turn/billing are synced by the runtime.
    fn post_call(
        &mut self,
        _name: &str,
        _args: &serde_json::Value,
        _retn: &serde_json::Value,
    ) -> Option<Response> {
        None
    }
}

/// Outcome of one agent run.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Final assistant text, if the conversation ended with one.
    pub text: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Index of the last turn, `None` for tool-less completions.
    pub turn: Option<usize>,
    pub error: Option<String>,
    /// Accumulated cost in USD, `None` if the model pricing is unknown.
    pub billing: Option<f64>,
    /// Short-circuited validator success, if any.
    pub validated: Option<Success>,
}

impl Response {
    fn failed(messages: Vec<ChatMessage>, turn: Option<usize>, error: String) -> Self {
        Self {
            messages,
            turn,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Multi-turn tool-calling loop over the chat completion API.
///
/// The loop is strictly sequential: one completion, then synchronous tool
/// dispatch, then the next completion.
pub struct Agent {
    client: Client<OpenAIConfig>,
    runtime: tokio::runtime::Runtime,
    journal: Option<Journal>,
}

impl Agent {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("cannot build the agent runtime")?;
        Ok(Self {
            client: Client::new(),
            runtime,
            journal: None,
        })
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn journal(&self, msg: impl AsRef<str>) {
        if let Some(journal) = &self.journal {
            journal.log(msg);
        }
    }

    /// Run the agent until the model responds with plain text, a `post_call`
    /// hook short-circuits, or the turn budget runs out.
    pub fn run(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        toolbox: Option<&mut dyn Toolbox>,
        temperature: f32,
        max_turns: usize,
        seed: i64,
    ) -> Response {
        self.journal(format!(
            "request: model={model}, temperature={temperature}, max_turns={max_turns}, seed={seed}"
        ));
        let mut messages = messages;

        // single conversation if no tool is registered
        let Some(toolbox) = toolbox else {
            return match self.completion(model, &messages, &[], temperature, seed) {
                Ok((reply, billing)) => {
                    let text = reply.content.clone();
                    messages.push(reply);
                    Response {
                        text,
                        messages,
                        billing,
                        ..Response::default()
                    }
                }
                Err(err) => Response::failed(messages, None, format!("{err:#}")),
            };
        };

        if !supports_function_calling(model) {
            let msg = format!("the given model `{model}` does not support function calling");
            self.journal(&msg);
            return Response::failed(messages, None, msg);
        }
        let specs = toolbox.tools();
        let tools = match render_tools(&specs) {
            Ok(tools) => tools,
            Err(err) => return Response::failed(messages, None, format!("{err:#}")),
        };

        let mut billing: Option<f64> = None;
        for turn in 0..max_turns {
            let reply = match self.completion(model, &messages, &tools, temperature, seed) {
                Ok((reply, price)) => {
                    if let Some(price) = price {
                        billing = Some(billing.unwrap_or(0.0) + price);
                    }
                    reply
                }
                Err(err) => {
                    let mut failed =
                        Response::failed(messages, Some(turn), format!("{err:#}"));
                    failed.billing = billing;
                    return failed;
                }
            };
            messages.push(reply.clone());

            // the model answered in plain text
            let Some(calls) = reply.tool_calls else {
                return Response {
                    text: reply.content,
                    messages,
                    turn: Some(turn),
                    billing,
                    ..Response::default()
                };
            };

            for call in calls {
                if !specs.iter().any(|spec| spec.name == call.name) {
                    let known = specs
                        .iter()
                        .map(|spec| spec.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    messages.push(ChatMessage::tool(
                        &call.id,
                        &call.name,
                        &format!(
                            "error: undefined function `{}`, available only `{known}`",
                            call.name
                        ),
                    ));
                    continue;
                }
                let mut args: serde_json::Value = match serde_json::from_str(&call.arguments) {
                    Ok(args) => args,
                    Err(err) => {
                        messages.push(ChatMessage::tool(
                            &call.id,
                            &call.name,
                            &format!("error: exception occured during parsing arguments, `{err}`"),
                        ));
                        continue;
                    }
                };
                toolbox.pre_call(&call.name, &mut args);
                self.journal(format!("tool call: {}({args})", call.name));
                let retn = match toolbox.dispatch(&call.name, args.clone()) {
                    Ok(retn) => retn,
                    Err(err) => {
                        messages.push(ChatMessage::tool(
                            &call.id,
                            &call.name,
                            &format!(
                                "error: exception occured during calling the function, `{err:#}`"
                            ),
                        ));
                        continue;
                    }
                };
                messages.push(ChatMessage::tool(&call.id, &call.name, &retn.to_string()));
                if let Some(mut instant) = toolbox.post_call(&call.name, &args, &retn) {
                    self.journal(format!("short-circuit after `{}`", call.name));
                    instant.messages = messages;
                    instant.turn = Some(turn);
                    instant.billing = billing;
                    return instant;
                }
            }
        }

        let msg = format!(
            "iteration exceeds the given maximum number of the turns of conversation, {max_turns}"
        );
        self.journal(&msg);
        let mut failed = Response::failed(messages, Some(max_turns), msg);
        failed.billing = billing;
        failed
    }

    /// One chat completion with bounded retry on transport errors.
    fn completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ChatCompletionTool],
        temperature: f32,
        seed: i64,
    ) -> Result<(ChatMessage, Option<f64>)> {
        let request = build_request(model, messages, tools, temperature, seed)?;
        let mut last = None;
        for attempt in 0..RETRY_N {
            match self
                .runtime
                .block_on(self.client.chat().create(request.clone()))
            {
                Ok(response) => {
                    let billing = response.usage.as_ref().and_then(|usage| {
                        price_of(&response.model).map(|(input, output)| {
                            input * usage.prompt_tokens as f64
                                + output * usage.completion_tokens as f64
                        })
                    });
                    let choice = response
                        .choices
                        .into_iter()
                        .next()
                        .ok_or_else(|| eyre!("empty choices in the completion response"))?;
                    let reply = ChatMessage {
                        role: "assistant".to_string(),
                        content: choice.message.content,
                        tool_calls: choice.message.tool_calls.map(|calls| {
                            calls
                                .into_iter()
                                .map(|call| ToolCall {
                                    id: call.id,
                                    name: call.function.name,
                                    arguments: call.function.arguments,
                                })
                                .collect()
                        }),
                        tool_call_id: None,
                        name: None,
                    };
                    self.journal(format!(
                        "response: {}",
                        serde_json::to_string(&reply).unwrap_or_default()
                    ));
                    return Ok((reply, billing));
                }
                Err(err) => {
                    log::warn!("completion attempt {attempt} failed: {err}");
                    last = Some(err);
                    std::thread::sleep(Duration::from_secs(1 + attempt as u64));
                }
            }
        }
        Err(eyre!(last.expect("at least one attempt")).wrap_err("completion request failed"))
    }
}

fn build_request(
    model: &str,
    messages: &[ChatMessage],
    tools: &[ChatCompletionTool],
    temperature: f32,
    seed: i64,
) -> Result<CreateChatCompletionRequest> {
    let outbound = messages
        .iter()
        .map(render_message)
        .collect::<Result<Vec<_>>>()?;
    let mut builder = CreateChatCompletionRequestArgs::default();
    builder
        .model(model)
        .messages(outbound)
        .temperature(temperature)
        .seed(seed);
    if !tools.is_empty() {
        builder
            .tools(tools.to_vec())
            .tool_choice(ChatCompletionToolChoiceOption::Auto);
    }
    Ok(builder.build()?)
}

fn render_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let content = message.content.clone().unwrap_or_default();
    let rendered = match message.role.as_str() {
        "system" => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        "user" => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        "assistant" => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(content) = &message.content {
                builder.content(content.as_str());
            }
            if let Some(calls) = &message.tool_calls {
                builder.tool_calls(
                    calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect::<Vec<_>>(),
                );
            }
            builder.build()?.into()
        }
        "tool" => ChatCompletionRequestToolMessageArgs::default()
            .content(content)
            .tool_call_id(message.tool_call_id.clone().unwrap_or_default())
            .build()?
            .into(),
        role => bail!("unsupported message role `{role}`"),
    };
    Ok(rendered)
}

fn render_tools(specs: &[ToolSpec]) -> Result<Vec<ChatCompletionTool>> {
    specs
        .iter()
        .map(|spec| {
            Ok(ChatCompletionToolArgs::default()
                .r#type(ChatCompletionToolType::Function)
                .function(
                    FunctionObjectArgs::default()
                        .name(spec.name.clone())
                        .description(spec.description.clone())
                        .parameters(spec.parameters.clone())
                        .build()?,
                )
                .build()?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_of() {
        let (input, output) = price_of("gpt-4o-mini-2024-07-18").unwrap();
        assert!(input < output);
        assert!(price_of("made-up-model").is_none());
    }

    #[test]
    fn test_supports_function_calling() {
        assert!(supports_function_calling("gpt-4o-mini-2024-07-18"));
        assert!(supports_function_calling("gpt-3.5-turbo"));
        assert!(!supports_function_calling("text-davinci-003"));
    }

    #[test]
    fn test_chat_message_wire_format() -> Result<()> {
        let message = ChatMessage::tool("call_0", "validate", "{\"success\":true}");
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&message)?)?;
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_0");
        // absent fields stay off the wire
        assert!(value.get("tool_calls").is_none());
        Ok(())
    }

    #[test]
    fn test_render_message_roles() -> Result<()> {
        for role in ["system", "user", "assistant", "tool"] {
            let mut message = ChatMessage::plain(role, "hello");
            if role == "tool" {
                message.tool_call_id = Some("call_0".into());
            }
            render_message(&message)?;
        }
        assert!(render_message(&ChatMessage::plain("oracle", "hello")).is_err());
        Ok(())
    }

    #[test]
    fn test_render_tools() -> Result<()> {
        let specs = vec![ToolSpec {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"filename": {"type": "string"}},
                "required": ["filename"],
            }),
        }];
        let tools = render_tools(&specs)?;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "read_file");
        Ok(())
    }
}
