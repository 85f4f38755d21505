//! Decoding of the agent's newline-delimited JSON event stream.
//!
//! Only assistant text blocks matter to loopgate; every other event (tool use,
//! tool results, system and result records) is ignored.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant { message: AssistantMessage },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Result of decoding one stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// Assistant-authored text fragments, in order.
    Text(Vec<String>),
    /// A well-formed event carrying nothing of interest.
    Ignored,
    /// Not a valid event record.
    Malformed,
}

pub fn decode_line(line: &str) -> StreamLine {
    let line = line.trim();
    if line.is_empty() {
        return StreamLine::Ignored;
    }
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(StreamEvent::Assistant { message }) => {
            let texts: Vec<String> = message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => Some(text),
                    _ => None,
                })
                .collect();
            if texts.is_empty() {
                StreamLine::Ignored
            } else {
                StreamLine::Text(texts)
            }
        }
        Ok(StreamEvent::Other) => StreamLine::Ignored,
        Err(_) => StreamLine::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_blocks_are_extracted() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"},{"type":"tool_use","name":"Read","input":{}},{"type":"text","text":"world"}]},"session_id":"abc"}"#;
        assert_eq!(
            decode_line(line),
            StreamLine::Text(vec!["Hello".to_string(), "world".to_string()])
        );
    }

    #[test]
    fn other_events_are_ignored() {
        let line = r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#;
        assert_eq!(decode_line(line), StreamLine::Ignored);
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#;
        assert_eq!(decode_line(line), StreamLine::Ignored);
        assert_eq!(decode_line("   "), StreamLine::Ignored);
    }

    #[test]
    fn malformed_lines_are_reported_not_fatal() {
        assert_eq!(decode_line("{not json"), StreamLine::Malformed);
        assert_eq!(decode_line(r#"{"message":{}}"#), StreamLine::Malformed);
    }
}
