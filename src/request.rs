use serde::Serialize;

use crate::Error;

/// A streaming chat-completion request body.
///
/// The serialized form never contains a raw NUL byte, so it can be written
/// to the body port as is, followed by the terminating NUL.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        ChatRequest {
            model: model.into(),
            messages: vec![],
            stream: true,
            max_tokens: None,
        }
    }

    pub fn system(self, content: impl Into<String>) -> Self {
        self.message("system", content)
    }

    pub fn user(self, content: impl Into<String>) -> Self {
        self.message("user", content)
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    fn message(mut self, role: &str, content: impl Into<String>) -> Self {
        self.messages.push(Message {
            role: role.to_string(),
            content: content.into(),
        });
        self
    }

    /// JSON bytes for the body port.
    pub fn to_body(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_json() {
        let body = ChatRequest::new("gpt-4o-mini")
            .system("Be brief.")
            .user("Hi")
            .to_body()
            .unwrap();

        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["model"], "gpt-4o-mini");
        assert_eq!(v["stream"], true);
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "Hi");
        assert!(v.get("max_tokens").is_none());
    }

    #[test]
    fn nul_is_escaped() {
        let body = ChatRequest::new("m").user("a\0b").to_body().unwrap();
        assert!(!body.contains(&0));
    }
}
