//! Line-oriented sample feed.
//!
//! Each line is one JSON object:
//!
//! ```text
//! {"pv": "SP1K1:MONO:MMS:G_PI.RBV", "value": 10.0, "timestamp": "2024-05-01T12:00:00Z"}
//! {"pv": "SP1K1:MONO:MMS:M_PI.RBV", "value": 5.0}
//! ```
//!
//! A missing timestamp is filled in with the arrival time. Blank lines are
//! ignored and malformed lines are logged and skipped. Lines for names
//! nobody subscribed to are dropped.

use super::{Sample, SignalSource, Subscription};
use crate::error::{AppResult, CalcError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SampleLine {
    pv: String,
    value: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Decode one input line into a signal name and sample.
///
/// Returns `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> AppResult<Option<(String, Sample)>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: SampleLine = serde_json::from_str(line)?;
    let timestamp = parsed.timestamp.unwrap_or_else(Utc::now);
    Ok(Some((parsed.pv, Sample::new(parsed.value, timestamp))))
}

/// Queue depth per subscription.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type Queues = Arc<StdMutex<Option<HashMap<String, Vec<mpsc::Sender<Sample>>>>>>;

/// Signal source fed by an async line reader such as stdin.
///
/// Reading begins on [`SignalSource::start`]; when the reader reaches EOF all
/// subscriptions end. Each subscription gets a bounded queue and the reader
/// waits for room in it, so a burst of input is never dropped.
pub struct JsonLinesSource<R> {
    queues: Queues,
    capacity: usize,
    reader: Mutex<Option<R>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    /// Wrap a reader. Nothing is read until `start`.
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, DEFAULT_QUEUE_CAPACITY)
    }

    /// Wrap a reader, buffering at most `capacity` samples per subscription.
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            queues: Arc::new(StdMutex::new(Some(HashMap::new()))),
            capacity: capacity.max(1),
            reader: Mutex::new(Some(reader)),
            task: Mutex::new(None),
        }
    }

    /// Wait for the reader task to reach EOF.
    pub async fn finished(&self) -> AppResult<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.await.map_err(|e| CalcError::Join(e.to_string()))?;
        }
        Ok(())
    }
}

fn senders_for(queues: &Queues, pv: &str) -> Vec<mpsc::Sender<Sample>> {
    let mut queues = queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let Some(queues) = queues.as_mut() else {
        return Vec::new();
    };
    match queues.get_mut(pv) {
        Some(senders) => {
            senders.retain(|tx| !tx.is_closed());
            senders.clone()
        }
        None => Vec::new(),
    }
}

async fn pump<R>(reader: R, queues: Queues)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Sample input read failed: {}", e);
                break;
            }
        };
        line_no += 1;
        match parse_line(&line) {
            Ok(Some((pv, sample))) => {
                let senders = senders_for(&queues, &pv);
                if senders.is_empty() {
                    debug!("No subscriber for {} (line {})", pv, line_no);
                }
                for tx in senders {
                    // A dropped subscriber is pruned on the next lookup
                    let _ = tx.send(sample).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping line {}: {}", line_no, e),
        }
    }
    info!("Sample input closed after {} lines", line_no);
    queues
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
}

#[async_trait]
impl<R> SignalSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn subscribe(&self, name: &str) -> AppResult<Subscription> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // After EOF the sender is dropped here and the subscription ends at once
        if let Some(queues) = queues.as_mut() {
            queues.entry(name.to_string()).or_default().push(tx);
        }
        Ok(Subscription::from_queue(name, rx))
    }

    async fn start(&self) -> AppResult<()> {
        let Some(reader) = self.reader.lock().await.take() else {
            return Ok(());
        };
        let queues = self.queues.clone();
        *self.task.lock().await = Some(tokio::spawn(pump(reader, queues)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_line_with_timestamp() {
        let (pv, sample) = parse_line(
            r#"{"pv": "SP1K1:MONO:MMS:G_PI.RBV", "value": 10.0, "timestamp": "2024-05-01T12:00:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(pv, "SP1K1:MONO:MMS:G_PI.RBV");
        assert_eq!(sample.value, 10.0);
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_blank_and_malformed() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(matches!(
            parse_line(r#"{"pv": "X"}"#),
            Err(CalcError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_feeds_subscribers_then_closes() {
        let input = concat!(
            "{\"pv\": \"A\", \"value\": 1.0}\n",
            "not json\n",
            "\n",
            "{\"pv\": \"B\", \"value\": 2.0}\n",
            "{\"pv\": \"A\", \"value\": 3.0}\n",
        );
        let source = JsonLinesSource::new(tokio::io::BufReader::new(input.as_bytes()));
        let mut a = source.subscribe("A").await.unwrap();
        let mut b = source.subscribe("B").await.unwrap();
        source.start().await.unwrap();
        source.finished().await.unwrap();

        assert_eq!(a.next().await.unwrap().value, 1.0);
        assert_eq!(a.next().await.unwrap().value, 3.0);
        assert!(a.next().await.is_none());
        assert_eq!(b.next().await.unwrap().value, 2.0);
        assert!(b.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_waits_for_slow_subscriber() {
        let input: String = (0..100)
            .map(|i| format!("{{\"pv\": \"A\", \"value\": {}.0}}\n", i))
            .collect();
        let source = JsonLinesSource::with_capacity(std::io::Cursor::new(input.into_bytes()), 4);
        let mut a = source.subscribe("A").await.unwrap();
        source.start().await.unwrap();

        let mut values = Vec::new();
        while let Some(sample) = a.next().await {
            values.push(sample.value);
        }
        source.finished().await.unwrap();
        assert_eq!(values.len(), 100);
        assert_eq!(values.last(), Some(&99.0));
    }

    #[tokio::test]
    async fn test_subscribe_after_eof_ends_immediately() {
        let source = JsonLinesSource::new(std::io::Cursor::new(Vec::new()));
        source.start().await.unwrap();
        source.finished().await.unwrap();
        let mut late = source.subscribe("A").await.unwrap();
        assert!(late.next().await.is_none());
    }
}
