//! Outbound alarm notification.
//!
//! Grounded on `data_ingestion.py::send_email_alarm`'s subject/body/
//! recipients/attachment contract, re-expressed as a direct SMTP client
//! instead of shelling out to `rtmail`.

use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("notification transport error: {0}")]
    Transport(String),
}

pub trait Notifier {
    fn send(&self, subject: &str, body: &str, recipients: &[String], attachment: Option<&Path>) -> Result<(), Error>;
}

pub struct SmtpNotifier {
    transport: lettre::SmtpTransport,
    from: lettre::message::Mailbox,
}

impl SmtpNotifier {
    pub fn new(relay: &str, from: &str) -> Result<Self, Error> {
        let transport = lettre::SmtpTransport::relay(relay)
            .map_err(|e| Error::Transport(e.to_string()))?
            .build();
        let from = from.parse().map_err(|_| Error::Transport(format!("invalid from address {from:?}")))?;
        Ok(Self { transport, from })
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, subject: &str, body: &str, recipients: &[String], attachment: Option<&Path>) -> Result<(), Error> {
        use lettre::message::{header::ContentType, Attachment, MultiPart, SinglePart};
        use lettre::{Message, Transport};

        let mut builder = Message::builder().from(self.from.clone());
        for recipient in recipients {
            let mailbox: lettre::message::Mailbox = recipient
                .parse()
                .map_err(|_| Error::Transport(format!("invalid recipient address {recipient:?}")))?;
            builder = builder.to(mailbox);
        }
        builder = builder.subject(subject);

        let email = match attachment {
            Some(path) => {
                let content = std::fs::read(path).map_err(|e| Error::Transport(e.to_string()))?;
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("attachment.txt")
                    .to_string();
                let attachment_part = Attachment::new(filename).body(content, ContentType::TEXT_PLAIN);
                builder
                    .multipart(
                        MultiPart::mixed()
                            .singlepart(SinglePart::plain(body.to_string()))
                            .singlepart(attachment_part),
                    )
                    .map_err(|e| Error::Transport(e.to_string()))?
            }
            None => builder.body(body.to_string()).map_err(|e| Error::Transport(e.to_string()))?,
        };

        self.transport
            .send(&email)
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }
}

/// A notifier used in tests and dry-runs that records calls instead of
/// sending mail.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<(String, String, Vec<String>)>>,
}

impl Notifier for RecordingNotifier {
    fn send(&self, subject: &str, body: &str, recipients: &[String], _attachment: Option<&Path>) -> Result<(), Error> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string(), recipients.to_vec()));
        Ok(())
    }
}
