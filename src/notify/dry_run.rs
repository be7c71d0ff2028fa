use async_trait::async_trait;

use super::Notifier;
use crate::errors::DeliveryFailed;
use crate::format::{FormattedMessage, ReadMoreButton};

/// Dry-run channel: logs the message and reports success.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        message: &FormattedMessage,
        button: Option<&ReadMoreButton>,
    ) -> Result<(), DeliveryFailed> {
        tracing::info!(
            target: "digest::dry_run",
            link = %message.link,
            button = button.map(|b| b.label.as_str()).unwrap_or("-"),
            "\n{}",
            message.text
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
