//! SMS and email notifications sent on lifecycle transitions.
//!
//! Sends are fire-and-forget: a failure is logged and never aborts the
//! operation that triggered it. There is no retry.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{Config, TwilioConfig};
use crate::errors::Result;
use crate::models::User;

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()>;
    async fn send_email(&self, message: &EmailMessage) -> Result<()>;
}

/// Twilio for SMS and a JSON mail relay for email. Channels without a
/// configured provider only log the message.
pub struct HttpNotifier {
    client: Client,
    twilio: Option<TwilioConfig>,
    country_code: String,
    mail_relay_url: Option<String>,
    mail_from: String,
}

impl HttpNotifier {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            twilio: config.twilio.clone(),
            country_code: config.sms_country_code.clone(),
            mail_relay_url: config.mail_relay_url.clone(),
            mail_from: config.mail_from.clone(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        let number = international_number(&self.country_code, to);
        let Some(twilio) = &self.twilio else {
            info!("SMS to {number} (no provider configured): {body}");
            return Ok(());
        };

        let url = format!("{TWILIO_API}/Accounts/{}/Messages.json", twilio.account_sid);
        self.client
            .post(url)
            .basic_auth(&twilio.account_sid, Some(&twilio.auth_token))
            .form(&[
                ("To", number.as_str()),
                ("From", twilio.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        let Some(relay) = &self.mail_relay_url else {
            info!(
                "Email to {} (no relay configured): {}",
                message.to, message.subject
            );
            return Ok(());
        };

        self.client
            .post(relay)
            .json(&json!({
                "from": self.mail_from,
                "to": message.to,
                "subject": message.subject,
                "html": message.html,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn international_number(country_code: &str, number: &str) -> String {
    let number = number.trim();
    if number.starts_with('+') {
        number.to_string()
    } else {
        format!("{country_code}{number}")
    }
}

/// Send an SMS to `user` if they have a contact number.
pub async fn sms_user(notifier: &dyn Notifier, user: &User, body: &str) {
    let Some(number) = user.contact_number.as_deref().filter(|n| !n.trim().is_empty()) else {
        warn!("User {} has no contact number; SMS skipped", user.id);
        return;
    };
    if let Err(e) = notifier.send_sms(number, body).await {
        warn!("SMS to user {} failed: {e}", user.id);
    }
}

pub async fn email_user(notifier: &dyn Notifier, message: &EmailMessage) {
    if let Err(e) = notifier.send_email(message).await {
        warn!("Email to {} failed: {e}", message.to);
    }
}

/// Escape text for interpolation into an HTML body.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ─────────────────────────────────────────────────────────
// Message templates
// ─────────────────────────────────────────────────────────

/// Ask a matched NGO or volunteer to accept or reject a transaction.
pub fn participation_request(
    base_url: &str,
    transaction_id: i64,
    user: &User,
    message: &str,
) -> EmailMessage {
    let confirm_url = format!("{base_url}/api/transaction/confirm/{transaction_id}/{}", user.id);
    let reject_url = format!("{base_url}/api/transaction/reject/{transaction_id}/{}", user.id);
    let html = format!(
        r#"<p>Hi {name},</p>
<p>{message}</p>
<p><a href="{confirm_url}">Accept</a> &middot; <a href="{reject_url}">Reject</a></p>
<p>FoodLoop Team</p>"#,
        name = escape_html(&user.name),
        message = escape_html(message),
    );
    EmailMessage {
        to: user.email.clone(),
        subject: "Please Confirm Participation".to_string(),
        html,
    }
}

pub fn match_notice(donor: &User, transaction_id: i64) -> EmailMessage {
    EmailMessage {
        to: donor.email.clone(),
        subject: "Your donation has been matched".to_string(),
        html: format!(
            "<p>Hi {},</p><p>Your donation (ID: {transaction_id}) has been matched with a \
             nearby NGO. We will let you know once it is confirmed.</p><p>FoodLoop Team</p>",
            escape_html(&donor.name)
        ),
    }
}

pub fn donor_confirmed_sms(donor: &User, transaction_id: i64) -> String {
    format!(
        "Hi {}, your donation (ID: {transaction_id}) has been confirmed! Thank you for your generosity.",
        donor.name
    )
}

pub fn donor_claimed_sms(donor: &User, transaction_id: i64) -> String {
    format!(
        "Hi {}, your donation (ID: {transaction_id}) has been claimed! Thank you for your generosity.",
        donor.name
    )
}

pub fn ngo_claimed_sms(ngo: &User, transaction_id: i64) -> String {
    format!(
        "Hi {}, you've successfully claimed donation (ID: {transaction_id}).",
        ngo.name
    )
}

pub fn volunteer_assigned_sms(volunteer: &User, transaction_id: i64) -> String {
    format!(
        "Hi {}, you've been confirmed to deliver donation (ID: {transaction_id}).",
        volunteer.name
    )
}
