//! HTML bodies for the notification emails.

use pingflow_types::directory::{ConnectionDetails, User};

use crate::mail::EmailMessage;

pub const CONNECTION_REQUEST_SUBJECT: &str = "👋🏻 New Connection Request";

fn wrap(greeting_name: &str, paragraphs: &str) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif; padding: 20px;">
    <h2>Hi {greeting_name},</h2>
    {paragraphs}
    <br/>
    <p>Thanks, <br/> PingUp - Stay Connected</p>
</div>"#
    )
}

fn link(frontend_url: &str, path: &str) -> String {
    format!(
        r#"<a href="{}/{path}" style="color: #10b981;">here</a>"#,
        frontend_url.trim_end_matches('/')
    )
}

/// First notice about a new connection request.
pub fn connection_request(conn: &ConnectionDetails, frontend_url: &str) -> EmailMessage {
    let body = format!(
        "<p>You have a new connection request from {} - @{}.</p>\n    <p>Click {} to accept or reject the request.</p>",
        conn.from_user.full_name,
        conn.from_user.username,
        link(frontend_url, "connections"),
    );
    EmailMessage {
        to: conn.to_user.email.clone(),
        subject: CONNECTION_REQUEST_SUBJECT.to_string(),
        html: wrap(&conn.to_user.full_name, &body),
    }
}

/// Reminder about a request still pending a day later.
pub fn connection_reminder(conn: &ConnectionDetails, frontend_url: &str) -> EmailMessage {
    let body = format!(
        "<p>This is a reminder that you have a pending connection request from {} - @{}.</p>\n    <p>Click {} to accept or reject the request.</p>",
        conn.from_user.full_name,
        conn.from_user.username,
        link(frontend_url, "connections"),
    );
    EmailMessage {
        to: conn.to_user.email.clone(),
        subject: CONNECTION_REQUEST_SUBJECT.to_string(),
        html: wrap(&conn.to_user.full_name, &body),
    }
}

/// Daily digest of unseen messages.
pub fn unseen_messages(user: &User, count: u64, frontend_url: &str) -> EmailMessage {
    let noun = if count == 1 { "message" } else { "messages" };
    let body = format!(
        "<p>You have {count} unseen {noun} in your inbox.</p>\n    <p>Click {} to view them.</p>",
        link(frontend_url, "messages"),
    );
    EmailMessage {
        to: user.email.clone(),
        subject: format!("You have {count} unseen {noun}"),
        html: wrap(&user.full_name, &body),
    }
}
