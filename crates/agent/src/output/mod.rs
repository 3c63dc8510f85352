mod cloud;
mod local;

use async_trait::async_trait;

use crate::error::AgentResult;
use fleet_common::types::TelemetryEnvelope;

pub use cloud::CloudWriter;
pub use local::LocalWriter;

/// A sink for telemetry envelopes. The scheduler writes to every configured
/// writer in turn; one writer failing never stops the others.
#[async_trait]
pub trait Writer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn write(&self, envelope: &TelemetryEnvelope) -> AgentResult<()>;
}
