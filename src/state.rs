use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    Pending,
    Downloading,
    Done,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Done,
    Partial,
    Error,
}

impl TaskStatus {
    /// Aggregate status of a task, derived only from its parts.
    pub fn derive(parts: &[Part]) -> Self {
        let in_flight = parts
            .iter()
            .any(|p| matches!(p.status, PartStatus::Pending | PartStatus::Downloading));
        if in_flight {
            return TaskStatus::Running;
        }

        let done = parts.iter().filter(|p| p.status == PartStatus::Done).count();
        if done == parts.len() {
            TaskStatus::Done
        } else if done == 0 {
            TaskStatus::Error
        } else {
            TaskStatus::Partial
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub url: String,
    pub file_name: String,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub status: PartStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Part {
    pub fn pending(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            bytes_total: 0,
            bytes_done: 0,
            status: PartStatus::Pending,
            error: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub created_at: i64,
    pub status: TaskStatus,
    pub parts: Vec<Part>,
}

impl Task {
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn bytes_done(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes_done).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes_total).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn part(status: PartStatus) -> Part {
        Part {
            status,
            ..Part::pending("https://example.com/a.bin", "a.bin")
        }
    }

    #[test]
    fn test_derive_all_done() {
        let parts = vec![part(PartStatus::Done), part(PartStatus::Done)];
        assert_eq!(TaskStatus::derive(&parts), TaskStatus::Done);
    }

    #[test]
    fn test_derive_mixed_is_partial() {
        let parts = vec![part(PartStatus::Done), part(PartStatus::Error)];
        assert_eq!(TaskStatus::derive(&parts), TaskStatus::Partial);
    }

    #[test]
    fn test_derive_all_failed_is_error() {
        let parts = vec![part(PartStatus::Error), part(PartStatus::Error)];
        assert_eq!(TaskStatus::derive(&parts), TaskStatus::Error);
    }

    #[test]
    fn test_derive_in_flight_is_running() {
        let parts = vec![part(PartStatus::Done), part(PartStatus::Pending)];
        assert_eq!(TaskStatus::derive(&parts), TaskStatus::Running);

        let parts = vec![part(PartStatus::Error), part(PartStatus::Downloading)];
        assert_eq!(TaskStatus::derive(&parts), TaskStatus::Running);
    }

    #[test]
    fn test_serialized_field_names() {
        let task = Task {
            id: "abc".to_string(),
            created_at: 123,
            status: TaskStatus::Running,
            parts: vec![part(PartStatus::Downloading)],
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "abc",
                "created_at": 123,
                "status": "running",
                "parts": [{
                    "url": "https://example.com/a.bin",
                    "file_name": "a.bin",
                    "bytes_total": 0,
                    "bytes_done": 0,
                    "status": "downloading"
                }]
            })
        );
    }

    #[test]
    fn test_error_message_round_trips() {
        let mut p = part(PartStatus::Error);
        p.error = Some("unexpected status: 404 Not Found".to_string());
        let raw = serde_json::to_string(&p).unwrap();
        assert!(raw.contains("\"error\":\"unexpected status: 404 Not Found\""));
        let back: Part = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, p);
    }
}
