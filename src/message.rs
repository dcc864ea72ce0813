use std::fmt;

/// Terminal event name for a failed run.
pub const EVENT_ERROR: &str = "error";
/// Terminal event name for a completed run.
pub const EVENT_SUCCESS: &str = "success";

/// A Server-Sent Event message, immutable once constructed.
///
/// `group` is the hostname whose broadcast group the message belongs to; it
/// is routing metadata and never appears on the wire.
///
/// `data` must not contain a newline: the wire format is line-oriented and
/// this layer does no escaping, so an embedded newline would corrupt the
/// stream. Callers own that constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u32>,
    pub group: String,
}

impl Message {
    /// A plain progress update (no event name).
    pub fn progress(group: &str, data: &str) -> Self {
        Message {
            event: None,
            data: data.to_string(),
            id: None,
            retry: None,
            group: group.to_string(),
        }
    }

    /// The terminal message of a successful run.
    pub fn success(group: &str, data: &str) -> Self {
        Message {
            event: Some(EVENT_SUCCESS.to_string()),
            ..Message::progress(group, data)
        }
    }

    /// The terminal message of a failed run.
    pub fn error(group: &str, data: &str) -> Self {
        Message {
            event: Some(EVENT_ERROR.to_string()),
            ..Message::progress(group, data)
        }
    }

    /// True for the `success`/`error` messages that end a run. Nothing may
    /// be published to a group after its terminal message.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event.as_deref(), Some(EVENT_ERROR) | Some(EVENT_SUCCESS))
    }
}

/// Canonical wire encoding: one field per line in fixed order (id, retry,
/// event, data), absent optional fields omitted entirely, blank line
/// terminator.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.id {
            writeln!(f, "id: {}", id)?;
        }
        if let Some(retry) = self.retry {
            writeln!(f, "retry: {}", retry)?;
        }
        if let Some(event) = &self.event {
            writeln!(f, "event: {}", event)?;
        }
        writeln!(f, "data: {}", self.data)?;
        writeln!(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_only() {
        let msg = Message::progress("app.example.com", "foo");
        assert_eq!(msg.to_string(), "data: foo\n\n");
    }

    #[test]
    fn test_event_and_data() {
        let msg = Message::error("app.example.com", "foo");
        assert_eq!(msg.to_string(), "event: error\ndata: foo\n\n");
    }

    #[test]
    fn test_id_and_data() {
        let msg = Message {
            id: Some("1".to_string()),
            ..Message::progress("app.example.com", "foo")
        };
        assert_eq!(msg.to_string(), "id: 1\ndata: foo\n\n");
    }

    #[test]
    fn test_all_fields() {
        let msg = Message {
            id: Some("1".to_string()),
            retry: Some(2),
            ..Message::error("app.example.com", "foo")
        };
        assert_eq!(msg.to_string(), "id: 1\nretry: 2\nevent: error\ndata: foo\n\n");
    }

    #[test]
    fn test_terminal_markers() {
        assert!(Message::success("h", "Ready").is_terminal());
        assert!(Message::error("h", "boom").is_terminal());
        assert!(!Message::progress("h", "working").is_terminal());
    }
}
