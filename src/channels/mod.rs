//! Chat transports.

pub mod telegram;

pub use telegram::{BotEvent, Sender, TelegramChannel, decode_batch, parse_update};
