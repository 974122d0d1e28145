use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::Demand;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Delivers notifications. Delivery is fire-and-forget for the pipeline: a
/// failed batch is logged by the caller, never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Returns how many messages were accepted.
    async fn send_batch(&self, messages: Vec<Notification>) -> Result<usize, AppError>;
}

/// Writes notifications to the log instead of sending them.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send_batch(&self, messages: Vec<Notification>) -> Result<usize, AppError> {
        for message in &messages {
            log::info!("Notification to {}: {}", message.recipient, message.subject);
            log::debug!("{}", message.text_body);
        }
        Ok(messages.len())
    }
}

pub struct SmtpSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSink {
    pub fn new(config: &AppConfig, host: &str) -> Result<Self, AppError> {
        let from: Mailbox = config
            .email_from
            .parse()
            .map_err(|e| AppError::Notification(format!("invalid sender address: {}", e)))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| AppError::Notification(format!("SMTP relay {}: {}", host, e)))?
            .port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self { transport: builder.build(), from })
    }

    fn build_message(&self, message: &Notification) -> Result<Message, AppError> {
        let to: Mailbox = message
            .recipient
            .parse()
            .map_err(|e| AppError::Notification(format!("invalid recipient {}: {}", message.recipient, e)))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                message.text_body.clone(),
                message.html_body.clone(),
            ))
            .map_err(|e| AppError::Notification(e.to_string()))
    }
}

#[async_trait]
impl NotificationSink for SmtpSink {
    async fn send_batch(&self, messages: Vec<Notification>) -> Result<usize, AppError> {
        let mut sent = 0;
        for message in &messages {
            let email = match self.build_message(message) {
                Ok(email) => email,
                Err(e) => {
                    log::warn!("Skipping notification to {}: {}", message.recipient, e);
                    continue;
                }
            };
            match self.transport.send(email).await {
                Ok(_) => sent += 1,
                Err(e) => log::warn!("Failed to send notification to {}: {}", message.recipient, e),
            }
        }
        log::info!("Sent {}/{} notifications", sent, messages.len());
        Ok(sent)
    }
}

pub fn create_sink(config: &AppConfig) -> Result<Arc<dyn NotificationSink>, AppError> {
    match &config.smtp_host {
        Some(host) => {
            log::info!("Sending notifications through SMTP relay {}", host);
            Ok(Arc::new(SmtpSink::new(config, host)?))
        }
        None => {
            log::info!("No SMTP relay configured, notifications go to the log");
            Ok(Arc::new(LogSink))
        }
    }
}

pub fn download_link(base_url: &str, demand: &Demand) -> Result<Url, AppError> {
    Ok(Url::parse(base_url)?.join(&format!("download/{}", demand.request_token))?)
}

fn greeting(demand: &Demand) -> String {
    format!("Hello {} {},", demand.first_name, demand.name)
}

pub fn results_ready(base_url: &str, directory_name: &str, demand: &Demand) -> Result<Notification, AppError> {
    let link = download_link(base_url, demand)?;
    let count = demand.photos.len();
    Ok(Notification {
        recipient: demand.email.clone(),
        subject: format!("{} - Your photos are available!", directory_name),
        text_body: format!(
            "{}\n\nWe found {} photo(s) of you in {}.\nDownload them here: {}\n",
            greeting(demand),
            count,
            directory_name,
            link
        ),
        html_body: format!(
            "<p>{}</p><p>We found {} photo(s) of you in {}.</p><p><a href=\"{}\">Download your photos</a></p>",
            greeting(demand),
            count,
            directory_name,
            link
        ),
    })
}

pub fn no_results(directory_name: &str, demand: &Demand) -> Notification {
    Notification {
        recipient: demand.email.clone(),
        subject: format!("{} - No photo found", directory_name),
        text_body: format!(
            "{}\n\nWe could not find any photo of you in {}.\n",
            greeting(demand),
            directory_name
        ),
        html_body: format!(
            "<p>{}</p><p>We could not find any photo of you in {}.</p>",
            greeting(demand),
            directory_name
        ),
    }
}

pub fn encoding_error(directory_name: &str, demand: &Demand, error: &str) -> Notification {
    Notification {
        recipient: demand.email.clone(),
        subject: format!("{} - Face recognition error", directory_name),
        text_body: format!(
            "{}\n\nYour photo could not be processed: {}.\nPlease submit a new photo showing your face clearly.\n",
            greeting(demand),
            error
        ),
        html_body: format!(
            "<p>{}</p><p>Your photo could not be processed: {}.</p><p>Please submit a new photo showing your face clearly.</p>",
            greeting(demand),
            error
        ),
    }
}
