//! Ticket bootstrap requests
//!
//! A session can be started from an issue-tracker ticket. The ticket is turned
//! into an initial instruction via a template with `{{url}}`, `{{id}}` and
//! `{{title}}` placeholders.

use serde::{Deserialize, Serialize};

use crate::git::sanitize_branch_name;

/// Request to start a session for a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequest {
    #[serde(alias = "ticketId")]
    pub ticket_id: String,
    pub title: String,
    pub url: String,
}

impl TicketRequest {
    pub fn new(
        ticket_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            title: title.into(),
            url: url.into(),
        }
    }

    /// Branch used when the ticket gets its own worktree
    pub fn branch_name(&self) -> String {
        let id = sanitize_branch_name(&self.ticket_id.replace('/', "-"));
        if id.is_empty() {
            "ticket/work".to_string()
        } else {
            format!("ticket/{}", id)
        }
    }
}

/// Fill the ticket placeholders of `template` in a single pass, so values
/// containing placeholder text are inserted verbatim
pub fn render_prompt(template: &str, ticket: &TicketRequest) -> String {
    let mut out = String::with_capacity(template.len() + ticket.url.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + len].trim();
        let value = match key {
            "url" => Some(ticket.url.as_str()),
            "id" => Some(ticket.ticket_id.as_str()),
            "title" => Some(ticket.title.as_str()),
            _ => None,
        };

        out.push_str(&rest[..start]);
        match value {
            Some(value) => {
                out.push_str(value);
                rest = &rest[start + 2 + len + 2..];
            }
            None => {
                out.push_str("{{");
                rest = &rest[start + 2..];
            }
        }
    }

    out.push_str(rest);
    out
}
