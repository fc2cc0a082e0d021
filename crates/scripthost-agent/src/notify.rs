//! Outbound alert delivery.

use std::{future::Future, time::Duration};

use anyhow::Context;

// Chat API message limit is 4096 chars; stay well under it in bytes.
const MAX_MESSAGE_BYTES: usize = 3500;

pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, recipient: i64, text: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Administrator first, then the owner if it is a different, real account.
pub fn alert_recipients(admin_id: i64, owner: Option<i64>) -> Vec<i64> {
    let mut out = Vec::with_capacity(2);
    if admin_id != 0 {
        out.push(admin_id);
    }
    if let Some(owner) = owner
        && owner != 0
        && owner != admin_id
    {
        out.push(owner);
    }
    out
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// Sends through the chat bot HTTP API.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("scripthost-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{token}"),
        })
    }
}

#[derive(serde::Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: i64, text: &str) -> anyhow::Result<()> {
        let text = truncate_utf8(text, MAX_MESSAGE_BYTES);
        self.client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&SendMessage {
                chat_id: recipient,
                text: &text,
                disable_web_page_preview: true,
            })
            .send()
            .await
            .context("request sendMessage")?
            .error_for_status()
            .context("sendMessage returned non-2xx")?;
        Ok(())
    }
}

/// Used when no bot token is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, recipient: i64, text: &str) -> anyhow::Result<()> {
        tracing::warn!(recipient, op = "notify", "{text}");
        Ok(())
    }
}

/// Runtime choice between the two notifiers.
#[derive(Debug, Clone)]
pub enum AnyNotifier {
    Telegram(TelegramNotifier),
    Log(LogNotifier),
}

impl AnyNotifier {
    pub fn from_config(token: Option<&str>, timeout: Duration) -> Self {
        match token.map(|t| TelegramNotifier::new(t, timeout)) {
            Some(Ok(n)) => AnyNotifier::Telegram(n),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "chat notifier unavailable; alerts go to the log");
                AnyNotifier::Log(LogNotifier)
            }
            None => AnyNotifier::Log(LogNotifier),
        }
    }
}

impl Notifier for AnyNotifier {
    async fn notify(&self, recipient: i64, text: &str) -> anyhow::Result<()> {
        match self {
            AnyNotifier::Telegram(n) => n.notify(recipient, text).await,
            AnyNotifier::Log(n) => n.notify(recipient, text).await,
        }
    }
}
