//! Operator sink — where completed registrations are forwarded.

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::store::Subject;

/// External recipient of registration submissions.
///
/// Delivery failure is logged by callers, never retried, and never blocks
/// the user-facing confirmation.
#[async_trait]
pub trait OperatorSink: Send + Sync {
    async fn notify_registration(
        &self,
        subject: &Subject,
        payload: &str,
    ) -> Result<(), ChannelError>;
}
