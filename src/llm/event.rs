//! Semantic stream events.
//!
//! Every adapter reduces its wire protocol to these five events. They never carry
//! transport errors; those come back from `Stream::next` as `Err`.

use serde::{Deserialize, Serialize};

use super::types::ToolCall;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Text fragment for the content block at `index`
    TextDelta { index: usize, delta: String },
    /// Reasoning fragment for the content block at `index`
    ThinkingDelta { index: usize, delta: String },
    /// A tool invocation has started
    ToolCallBegin { id: String, name: String },
    /// Fragment of a tool's raw JSON arguments
    ToolCallDelta { id: String, delta: String },
    /// A tool invocation is complete
    ToolCallEnd { call: ToolCall },
}

impl Event {
    /// Content index for text and thinking deltas
    pub fn index(&self) -> Option<usize> {
        match self {
            Event::TextDelta { index, .. } | Event::ThinkingDelta { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Tool call id for tool events
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Event::ToolCallBegin { id, .. } | Event::ToolCallDelta { id, .. } => Some(id),
            Event::ToolCallEnd { call } => Some(&call.id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::TextDelta {
            index: 0,
            delta: "test".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("text_delta"));
        assert!(json.contains("test"));
    }

    #[test]
    fn test_event_index() {
        let text = Event::TextDelta {
            index: 2,
            delta: "a".to_string(),
        };
        let thinking = Event::ThinkingDelta {
            index: 1,
            delta: "b".to_string(),
        };
        let begin = Event::ToolCallBegin {
            id: "c1".to_string(),
            name: "ls".to_string(),
        };
        assert_eq!(text.index(), Some(2));
        assert_eq!(thinking.index(), Some(1));
        assert_eq!(begin.index(), None);
    }

    #[test]
    fn test_event_tool_call_id() {
        let end = Event::ToolCallEnd {
            call: ToolCall::new("c9", "ls", ""),
        };
        let delta = Event::ToolCallDelta {
            id: "c9".to_string(),
            delta: "{".to_string(),
        };
        assert_eq!(end.tool_call_id(), Some("c9"));
        assert_eq!(delta.tool_call_id(), Some("c9"));
        assert_eq!(
            Event::TextDelta {
                index: 0,
                delta: String::new()
            }
            .tool_call_id(),
            None
        );
    }
}
