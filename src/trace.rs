//! JSONL trace of a run, excluding the high-frequency stream tokens.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::warn;

use rlm_event_bus::InMemoryBus;

use crate::events::EngineEvent;

pub struct TraceLog;

impl TraceLog {
    /// Tap the bus and append every non-token event to `path`, one JSON
    /// object per line. Runs until the bus is dropped.
    pub fn attach(bus: Arc<InMemoryBus<EngineEvent>>, path: PathBuf) {
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(file) => file,
                Err(err) => {
                    warn!(%err, path = %path.display(), "trace log unavailable");
                    return;
                }
            };
            while let Ok(event) = receiver.recv().await {
                if event.is_stream_token() {
                    continue;
                }
                let Ok(mut line) = serde_json::to_string(&event) else {
                    continue;
                };
                line.push('\n');
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    warn!(%err, "trace write failed; stopping trace");
                    return;
                }
            }
            let _ = file.flush().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_skips_stream_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let bus = InMemoryBus::new(64);
        TraceLog::attach(Arc::clone(&bus), path.clone());
        tokio::task::yield_now().await;

        bus.emit(EngineEvent::IterationStart {
            iteration: 1,
            task_goal: "g".into(),
        });
        bus.emit(EngineEvent::StreamToken {
            token: "x".into(),
            iteration: 1,
        });
        bus.emit(EngineEvent::Complete { final_value: None });

        // Give the writer a moment, then drop the bus to end the task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("iteration-start"));
        assert!(contents.contains("complete"));
        assert!(!contents.contains("stream-token"));
    }
}
