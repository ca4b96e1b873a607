//! SSE line parsing and streaming tool-call assembly.
//!
//! OpenAI-compatible providers fragment tool calls across deltas: the name
//! usually arrives first, then argument string pieces, and some providers
//! only attach the call `id` on a later delta. The accumulator keys strictly
//! by the delta's `index` so late ids and interleaved calls both work.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::provider::ToolCall;

/// Parse one SSE line into its data payload, if it is a data line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
}

/// One streamed chunk as deserialized off the wire.
#[derive(Debug, Deserialize)]
pub struct WireChunk {
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct WireChoice {
    #[serde(default)]
    pub delta: WireDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireDelta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCallDelta {
    #[serde(default)]
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates fragmented tool-call deltas until the finish signal.
#[derive(Default)]
pub struct ToolCallAccumulator {
    // BTreeMap keeps calls in index order when finalized.
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Fold one delta into the buffer.
    pub fn push(&mut self, delta: &WireToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(ref id) = delta.id {
            entry.id = Some(id.clone());
        }
        if let Some(ref function) = delta.function {
            if let Some(ref name) = function.name {
                entry.name.push_str(name);
            }
            if let Some(ref args) = function.arguments {
                entry.arguments.push_str(args);
            }
        }
    }

    /// Finalize on the finish signal. Empty argument strings become `{}`
    /// (OpenAI convention); unparseable argument text is wrapped as
    /// `{"raw": …}` so the call is still delivered rather than dropped.
    pub fn finalize(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| {
                let args_str = call.arguments.trim();
                let arguments = if args_str.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(args_str)
                        .unwrap_or_else(|_| serde_json::json!({ "raw": args_str }))
                };
                ToolCall {
                    id: call.id.unwrap_or_else(|| format!("call_{index}")),
                    name: call.name,
                    arguments,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> WireToolCallDelta {
        WireToolCallDelta {
            index,
            id: id.map(String::from),
            function: Some(WireFunctionDelta {
                name: name.map(String::from),
                arguments: args.map(String::from),
            }),
        }
    }

    #[test]
    fn sse_data_lines_are_recognised() {
        assert_eq!(parse_sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: ping"), None);
    }

    #[test]
    fn arguments_accumulate_across_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, Some("c1"), Some("read_file"), None));
        acc.push(&delta(0, None, None, Some("{\"path\":")));
        acc.push(&delta(0, None, None, Some("\"readme.txt\"}")));
        let calls = acc.finalize();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "readme.txt");
    }

    #[test]
    fn late_id_updates_the_buffered_call() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, None, Some("web_search"), Some("{}")));
        acc.push(&delta(0, Some("call_abc"), None, None));
        let calls = acc.finalize();
        assert_eq!(calls[0].id, "call_abc");
    }

    #[test]
    fn missing_id_falls_back_to_index() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(2, None, Some("list_dir"), Some("{}")));
        let calls = acc.finalize();
        assert_eq!(calls[0].id, "call_2");
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, Some("c1"), Some("memory_read"), Some("")));
        let calls = acc.finalize();
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn unparseable_arguments_are_wrapped_as_raw() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, Some("c1"), Some("exec_shell"), Some("{broken")));
        let calls = acc.finalize();
        assert_eq!(calls[0].arguments["raw"], "{broken");
    }

    #[test]
    fn interleaved_calls_keep_index_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(1, Some("c2"), Some("second"), None));
        acc.push(&delta(0, Some("c1"), Some("first"), None));
        acc.push(&delta(1, None, None, Some("{}")));
        acc.push(&delta(0, None, None, Some("{}")));
        let calls = acc.finalize();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn nameless_buffers_are_discarded() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&delta(0, Some("c1"), None, Some("{}")));
        assert!(acc.finalize().is_empty());
    }
}
