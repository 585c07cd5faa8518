/// Notification mail contract
///
/// The coordinator never talks to a mail server itself. A `SendMail` function
/// is injected; `log_only_mailer` stands in when none is configured.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailHeader {
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailContent {
    pub subject: String,
    pub body_text: String,
}

/// Injected mail sender
pub type SendMail = Arc<dyn Fn(&MailHeader, &MailContent) -> anyhow::Result<()> + Send + Sync>;

/// Sender that only logs what it would have sent
pub fn log_only_mailer() -> SendMail {
    Arc::new(|header: &MailHeader, content: &MailContent| -> anyhow::Result<()> {
        tracing::info!("📧 Logging but not sending mail: from={} to={:?} subject={:?}\n{}",
            header.from, header.to, content.subject, content.body_text);
        Ok(())
    })
}
