use serde_json::Value;
use tracing::debug;

/// Accumulates raw bytes and yields complete newline-terminated lines,
/// holding a trailing partial line across chunk boundaries. Buffering stays
/// at the byte level: a chunk boundary may fall inside a multibyte character,
/// so decoding happens only once a line is complete.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left after the stream ends.
    pub fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// One structured event on the agent process stdout stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolCallDelta {
        id: String,
        delta: String,
    },
    ToolCallEnd {
        id: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
    Done,
    Error {
        message: String,
    },
}

/// Parses the agent process output: line-delimited JSON events, possibly
/// interleaved with plain diagnostic output. A line that fails to parse is
/// dropped, not a stream error.
#[derive(Default)]
pub struct StreamEventParser {
    lines: LineBuffer,
}

impl StreamEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.lines
            .feed(chunk)
            .iter()
            .filter_map(|line| parse_event_line(line))
            .collect()
    }

    /// Give a non-empty trailing buffer one final parse attempt.
    pub fn finish(self) -> Option<AgentEvent> {
        self.lines.finish().and_then(|line| parse_event_line(&line))
    }
}

fn parse_event_line(line: &str) -> Option<AgentEvent> {
    match serde_json::from_str::<AgentEvent>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Dropping unparseable agent stream line ({}): {}", e, line);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_line_parses_to_one_event() {
        let mut parser = StreamEventParser::new();
        let events = parser.feed(b"{\"type\":\"text\",\"text\":\"hi\"}\n");
        assert_eq!(
            events,
            vec![AgentEvent::Text {
                text: "hi".to_string()
            }]
        );
    }

    #[test]
    fn partial_line_is_buffered_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.feed(b"{\"id\":\"h\"").is_empty());
        let lines = buf.feed(b"}\n");
        assert_eq!(lines, vec!["{\"id\":\"h\"}".to_string()]);
        let value: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["id"], "h");
    }

    #[test]
    fn event_split_mid_json_is_reassembled() {
        let mut parser = StreamEventParser::new();
        assert!(parser.feed(b"{\"type\":\"tool_call_delta\",\"id\":\"h\"").is_empty());
        let events = parser.feed(b",\"delta\":\"x\"}\n");
        assert_eq!(
            events,
            vec![AgentEvent::ToolCallDelta {
                id: "h".to_string(),
                delta: "x".to_string()
            }]
        );
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut parser = StreamEventParser::new();
        let bytes = "{\"type\":\"text\",\"text\":\"héllo\"}\n".as_bytes();
        // Split between the two bytes of the é.
        let split = bytes.iter().position(|&b| b > 0x7f).unwrap() + 1;
        assert!(parser.feed(&bytes[..split]).is_empty());
        assert_eq!(
            parser.feed(&bytes[split..]),
            vec![AgentEvent::Text {
                text: "héllo".to_string()
            }]
        );
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut parser = StreamEventParser::new();
        let events = parser.feed(
            b"{\"type\":\"text\",\"text\":\"a\"}\n{\"type\":\"usage\",\"input_tokens\":10,\"output_tokens\":3}\n{\"type\":\"done\"}\n",
        );
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], AgentEvent::Done);
    }

    #[test]
    fn diagnostic_noise_is_dropped_not_fatal() {
        let mut parser = StreamEventParser::new();
        let events = parser.feed(b"npm WARN deprecated thing\n{\"type\":\"done\"}\n");
        assert_eq!(events, vec![AgentEvent::Done]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut parser = StreamEventParser::new();
        let events = parser.feed(b"\n\r\n   \n{\"type\":\"done\"}\n");
        assert_eq!(events, vec![AgentEvent::Done]);
    }

    #[test]
    fn finish_parses_unterminated_trailing_event() {
        let mut parser = StreamEventParser::new();
        assert!(parser.feed(b"{\"type\":\"done\"}").is_empty());
        assert_eq!(parser.finish(), Some(AgentEvent::Done));
    }

    #[test]
    fn finish_on_garbage_tail_is_none() {
        let mut parser = StreamEventParser::new();
        assert!(parser.feed(b"half a lin").is_empty());
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn tool_call_start_carries_opaque_input() {
        let mut parser = StreamEventParser::new();
        let events = parser.feed(
            b"{\"type\":\"tool_call_start\",\"id\":\"t1\",\"name\":\"bash\",\"input\":{\"command\":\"gmail list\"}}\n",
        );
        match &events[0] {
            AgentEvent::ToolCallStart { id, name, input } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "bash");
                assert_eq!(input["command"], "gmail list");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn crlf_lines_parse() {
        let mut parser = StreamEventParser::new();
        let events = parser.feed(b"{\"type\":\"done\"}\r\n");
        assert_eq!(events, vec![AgentEvent::Done]);
    }
}
