use std::path::PathBuf;

use async_trait::async_trait;

use super::Writer;
use crate::error::AgentResult;
use fleet_common::types::TelemetryEnvelope;

/// Writes the latest envelope to disk so operators can recover state
/// out-of-band. Each envelope overwrites the previous one.
pub struct LocalWriter {
    output_path: PathBuf,
}

impl LocalWriter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

#[async_trait]
impl Writer for LocalWriter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn write(&self, envelope: &TelemetryEnvelope) -> AgentResult<()> {
        let path = self.output_path.clone();
        let data = serde_json::to_vec_pretty(envelope)?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, &data)?;
            if let Err(e) = std::fs::rename(&tmp, &path) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
            Ok(())
        })
        .await
        .map_err(|e| crate::error::AgentError::Writer(format!("local write task failed: {e}")))??;

        Ok(())
    }
}
