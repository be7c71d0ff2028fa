pub mod dry_run;
pub mod telegram;

use async_trait::async_trait;

use crate::errors::DeliveryFailed;
use crate::format::{FormattedMessage, ReadMoreButton};

pub use dry_run::LogNotifier;
pub use telegram::TelegramNotifier;

/// Push channel for formatted articles. One call = one message; a failure only
/// affects that message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        message: &FormattedMessage,
        button: Option<&ReadMoreButton>,
    ) -> Result<(), DeliveryFailed>;

    fn name(&self) -> &'static str;
}
