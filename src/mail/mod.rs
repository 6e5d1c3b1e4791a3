//! Mail transports: IMAP for inbound, SMTP for outbound.

pub mod imap;
pub mod smtp;
pub mod text;

pub use imap::{DEFAULT_MAX_MESSAGE_SIZE, ImapMailbox, MailboxClient};
pub use smtp::{
    MailTransport, OutboundAttachment, OutboundMail, SentMail, SmtpMailer, UnconfiguredTransport,
    transport_from_config,
};
