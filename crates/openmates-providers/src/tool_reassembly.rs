use openmates_core::types::ToolCall;

/// Provider-agnostic tool-call stream reassembler (SPEC_FULL.md §4.B).
///
/// Generalizes the accumulation patterns in `anthropic_stream.rs`
/// (id/name/partial-JSON fields tracked across `content_block_*` events) and
/// `openai.rs` (tool-call deltas keyed by array index) into one state machine
/// usable by any adapter: feed it deltas keyed by a caller-assigned slot id,
/// and it finalizes a call when any of the three rules in §4.B fire:
///   a) a new call_id starts while one is open,
///   b) the caller reports `finish_reason == "tool_calls"`,
///   c) a content chunk arrives while a tool-call buffer is open (interruption).
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    open: Option<OpenCall>,
}

#[derive(Debug)]
struct OpenCall {
    slot: u32,
    call_id: String,
    name: String,
    args_buf: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment for `slot` (an adapter-local index or key). Returns a
    /// finalized `ToolCall` if a *different* slot was previously open (rule a).
    pub fn push_delta(
        &mut self,
        slot: u32,
        call_id: Option<&str>,
        name: Option<&str>,
        args_fragment: Option<&str>,
    ) -> Option<ToolCall> {
        let finalized = match &self.open {
            Some(open) if open.slot != slot => self.take_finalized(),
            _ => None,
        };

        let open = self.open.get_or_insert_with(|| OpenCall {
            slot,
            call_id: call_id.unwrap_or_default().to_string(),
            name: String::new(),
            args_buf: String::new(),
        });

        if let Some(id) = call_id {
            if !id.is_empty() {
                open.call_id = id.to_string();
            }
        }
        if let Some(n) = name {
            open.name.push_str(n);
        }
        if let Some(frag) = args_fragment {
            open.args_buf.push_str(frag);
        }

        finalized
    }

    /// A text/content chunk arrived. If a tool-call buffer is open, this is an
    /// interruption (rule c): finalize it as a best-effort partial.
    pub fn on_content_chunk(&mut self) -> Option<ToolCall> {
        if self.open.is_some() {
            self.take_finalized()
        } else {
            None
        }
    }

    /// The stream reported a terminal finish reason naming tool calls (rule b).
    pub fn finish(&mut self) -> Option<ToolCall> {
        self.take_finalized()
    }

    fn take_finalized(&mut self) -> Option<ToolCall> {
        let open = self.open.take()?;
        Some(ToolCall::finalize(open.call_id, open.name, open.args_buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizes_on_new_slot() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.push_delta(0, Some("call_1"), Some("get_docs"), Some("{\"a\":")).is_none());
        let finalized = acc.push_delta(1, Some("call_2"), Some("search"), Some("{}")).unwrap();
        assert_eq!(finalized.call_id, "call_1");
        assert_eq!(finalized.function_name, "get_docs");
    }

    #[test]
    fn finalizes_on_content_interruption() {
        let mut acc = ToolCallAccumulator::new();
        acc.push_delta(0, Some("call_1"), Some("get_docs"), Some("{}"));
        let finalized = acc.on_content_chunk().unwrap();
        assert_eq!(finalized.call_id, "call_1");
        assert!(acc.on_content_chunk().is_none());
    }

    #[test]
    fn accumulates_argument_fragments_in_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.push_delta(0, Some("call_1"), Some("f"), Some("{\"a\":"));
        acc.push_delta(0, None, None, Some("1}"));
        let finalized = acc.finish().unwrap();
        assert_eq!(finalized.arguments_raw, "{\"a\":1}");
        assert_eq!(finalized.arguments_parsed, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn finish_with_nothing_open_is_none() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.finish().is_none());
    }
}
