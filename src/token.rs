use serde::{Deserialize, Serialize};
use std::fmt;

/// An authentication token.
///
/// Bot tokens carry a `Bot ` prefix and OAuth tokens a `Bearer ` prefix; a
/// token without either is treated as a user token. The prefix is sent in the
/// REST `Authorization` header and stripped for the gateway identify payload.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wrap a raw token string, prefix included
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// A bot token from its bare secret
    pub fn bot(secret: &str) -> Self {
        Self(format!("Bot {}", secret))
    }

    /// Whether this is a bot token
    pub fn is_bot(&self) -> bool {
        self.0.starts_with("Bot ")
    }

    /// Whether this is an OAuth bearer token
    pub fn is_bearer(&self) -> bool {
        self.0.starts_with("Bearer ")
    }

    /// Whether this is a user token
    pub fn is_user(&self) -> bool {
        !(self.is_bot() || self.is_bearer())
    }

    /// Value for the REST `Authorization` header
    pub fn authorization(&self) -> &str {
        &self.0
    }

    /// The secret without its kind prefix, as sent in identify/resume
    pub fn secret(&self) -> &str {
        self.0
            .strip_prefix("Bot ")
            .or_else(|| self.0.strip_prefix("Bearer "))
            .unwrap_or(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.secret().trim().is_empty()
    }
}

impl From<&str> for Token {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Token {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

// Never print the secret
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_bot() {
            "bot"
        } else if self.is_bearer() {
            "bearer"
        } else {
            "user"
        };
        write!(f, "Token({}, ***)", kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_kinds() {
        let bot = Token::bot("abc.def");
        assert!(bot.is_bot());
        assert_eq!(bot.authorization(), "Bot abc.def");
        assert_eq!(bot.secret(), "abc.def");

        let bearer = Token::new("Bearer xyz");
        assert!(bearer.is_bearer());
        assert_eq!(bearer.secret(), "xyz");

        let user = Token::from("plain");
        assert!(user.is_user());
        assert_eq!(user.secret(), "plain");
    }

    #[test]
    fn test_debug_is_redacted() {
        let rendered = format!("{:?}", Token::bot("super-secret"));
        assert!(!rendered.contains("super-secret"));
        assert_eq!(rendered, "Token(bot, ***)");
    }
}
