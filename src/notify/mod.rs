pub mod message;
pub mod telegram;

use crate::error::NotifyError;
use async_trait::async_trait;

pub use self::message::MessageFormatter;
pub use self::telegram::TelegramNotifier;

/// Delivers one pre-formatted alert. Failures come back as values so the
/// caller can decide whether to mark the listing seen.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}
