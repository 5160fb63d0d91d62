//! Delivery: picking a device and mailing the file to it.

pub mod dispatcher;
pub mod mailer;
pub mod selector;

pub use dispatcher::{Delivered, DeliveryDispatcher, MailTransport, OutgoingMail};
pub use mailer::{SmtpMailer, SmtpSettings};
pub use selector::{ChoiceButton, DeviceChoice, DeviceSelector};
