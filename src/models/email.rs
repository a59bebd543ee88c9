use std::fmt;
use serde::{Deserialize, Serialize};

/// A parsed message. Built fresh on every fetch and never cached.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct EmailRecord {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub body: String,
    pub labels: Vec<String>,
}

impl EmailRecord {
    pub fn is_unread(&self) -> bool {
        self.labels.iter().any(|label| label == "UNREAD")
    }

    /// Body cut to at most `max_chars` characters, respecting char boundaries.
    pub fn body_preview(&self, max_chars: usize) -> String {
        match self.body.char_indices().nth(max_chars) {
            Some((idx, _)) => self.body[..idx].to_string(),
            None => self.body.clone(),
        }
    }

    /// Subject for a reply, with a single `Re: ` prefix.
    pub fn reply_subject(&self) -> String {
        let trimmed = self.subject.trim();
        if trimmed.get(..3).map_or(false, |prefix| prefix.eq_ignore_ascii_case("re:")) {
            trimmed.to_string()
        } else {
            format!("Re: {}", trimmed)
        }
    }
}

impl fmt::Display for EmailRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Email:")?;
        writeln!(f, "  ID: {}", self.id)?;
        writeln!(f, "  From: {}", self.from)?;
        if !self.to.is_empty() {
            writeln!(f, "  To: {}", self.to)?;
        }
        writeln!(f, "  Date: {}", self.date)?;
        writeln!(f, "  Subject: {}", self.subject)?;
        if !self.body.is_empty() {
            writeln!(f, "  Body: {}", self.body)?;
        } else if !self.snippet.is_empty() {
            writeln!(f, "  Snippet: {}", self.snippet)?;
        }
        Ok(())
    }
}

pub fn format_emails(emails: &[EmailRecord]) -> String {
    emails.iter()
        .map(|email| email.to_string())
        .collect::<Vec<_>>()
        .join("\n\n")
}
