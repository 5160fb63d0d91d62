//! Send-to-Kindle bot: receives documents over Telegram, converts them when
//! needed and mails them to a Kindle address.

pub mod channels;
pub mod config;
pub mod convert;
pub mod delivery;
pub mod devices;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod session;
