//! Mail transport: IMAP/SMTP mailbox and address helpers.

pub mod address;
pub mod email;

pub use address::{EmailAddress, reply_subject};
pub use email::{EmailConfig, ImapMailbox};
