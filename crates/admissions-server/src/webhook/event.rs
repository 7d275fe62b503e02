use serde_json::Value;

/// Enrollment events the pipeline enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentEventType {
    Created,
    Progress,
    Completed,
}

impl EnrollmentEventType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enrollment.created" => Some(Self::Created),
            "enrollment.progress" => Some(Self::Progress),
            "enrollment.completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "enrollment.created",
            Self::Progress => "enrollment.progress",
            Self::Completed => "enrollment.completed",
        }
    }

    /// Completions first, creations last.
    pub fn priority(&self) -> u32 {
        match self {
            Self::Completed => 1,
            Self::Progress => 2,
            Self::Created => 3,
        }
    }
}

/// An inbound `{id, type, data}` delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub data: Value,
}

impl WebhookEvent {
    /// Parse a delivery body. `None` when it is not JSON or when `id`, `type`
    /// or `data` is missing or empty. Numeric ids are accepted as their
    /// decimal string.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let object = value.as_object()?;

        let id = match object.get("id")? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let event_type = object
            .get("type")?
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())?
            .to_string();
        let data = object.get("data").filter(|d| !d.is_null())?.clone();

        Some(Self {
            id,
            event_type,
            data,
        })
    }
}
