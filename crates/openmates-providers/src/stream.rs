use openmates_core::types::ToolCall;

/// Events emitted during LLM streaming (SPEC_FULL.md §4.B). Grounded on
/// `skynet-agent/src/stream.rs::StreamEvent`, with `ToolUse` split into
/// `ToolCallDelta`/`ToolCallFinal` so a provider-agnostic reassembler (see
/// `tool_reassembly.rs`) can sit between the wire format and the consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallDelta { call_id: String, name: Option<String>, args_fragment: Option<String> },
    ToolCallFinal(ToolCall),
    Usage { tokens_in: u32, tokens_out: u32 },
    End,
    Error(String),
}

/// Parse a single SSE line (`event: ...` / `data: ...`). Grounded on
/// `skynet-agent/src/stream.rs::parse_sse_line`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ").map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        assert!(matches!(parse_sse_line("event: message_start"), Some(SseParsed::Event(e)) if e == "message_start"));
        assert!(matches!(parse_sse_line("data: {}"), Some(SseParsed::Data(d)) if d == "{}"));
        assert!(parse_sse_line("").is_none());
    }
}
