//! Email delivery for budget alerts.
//!
//! A small [`EmailSender`] seam with one production implementation over
//! lettre's async SMTP transport. Tests inject recording fakes.

use async_trait::async_trait;
use chrono::NaiveDate;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;

/// Content of a budget threshold alert.
#[derive(Debug, Clone)]
pub struct BudgetAlert {
    /// Org the alert is about.
    pub org_id: String,
    /// Threshold crossed, as a percentage (50 or 90).
    pub threshold_percent: u8,
    /// Hours consumed this period.
    pub used_hours: f64,
    /// Hours included with the subscription.
    pub included_hours: f64,
    /// First day of the next billing period.
    pub reset_date: NaiveDate,
    /// Deep link to plan management.
    pub plan_url: String,
}

impl BudgetAlert {
    /// Subject line for this alert.
    pub fn subject(&self) -> String {
        format!(
            "You've used {}% of your included sandbox hours",
            self.threshold_percent
        )
    }

    /// Plain-text body for this alert.
    pub fn body(&self) -> String {
        format!(
            "Your organization has used {:.1} of {:.1} included sandbox hours \
             this billing period ({}% threshold crossed).\n\n\
             Your allowance resets on {}.\n\n\
             Manage your plan: {}\n",
            self.used_hours,
            self.included_hours,
            self.threshold_percent,
            self.reset_date,
            self.plan_url,
        )
    }
}

/// Errors produced by email delivery.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// Transport could not be built from config.
    #[error("smtp configuration error: {0}")]
    Config(String),

    /// A recipient or sender address did not parse.
    #[error("invalid email address: {0}")]
    Address(String),

    /// The transport failed to deliver.
    #[error("email delivery failed: {0}")]
    Send(String),
}

/// Sends budget alerts.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver an alert to the given address.
    async fn send_budget_alert(&self, to: &str, alert: &BudgetAlert) -> Result<(), EmailError>;
}

/// SMTP-backed sender.
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSender {
    /// Build a sender from the SMTP config section.
    ///
    /// # Errors
    ///
    /// Returns an error when the relay host or from address is invalid.
    pub fn new(config: &SmtpConfig) -> Result<Self, EmailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| EmailError::Config(e.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        let from = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e: lettre::address::AddressError| EmailError::Address(e.to_string()))?;

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send_budget_alert(&self, to: &str, alert: &BudgetAlert) -> Result<(), EmailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to
                .parse()
                .map_err(|e: lettre::address::AddressError| EmailError::Address(e.to_string()))?)
            .subject(alert.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body())
            .map_err(|e| EmailError::Send(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| EmailError::Send(e.to_string()))?;

        Ok(())
    }
}
