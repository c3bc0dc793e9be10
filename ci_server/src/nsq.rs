//! nsqd HTTP producer backing the task queue.

use async_trait::async_trait;

use ci_signal::store::{TaskQueue, Topic};
use ci_signal::{Error, Result};

#[derive(Clone)]
pub struct NsqProducer {
    http: reqwest::Client,
    addr: String,
}

impl NsqProducer {
    pub fn new(http: reqwest::Client, addr: &str) -> Self {
        Self {
            http,
            addr: addr.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TaskQueue for NsqProducer {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/pub", self.addr))
            .query(&[("topic", topic.as_str())])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Queue(format!("publish to {topic}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Queue(format!(
                "nsqd rejected message on {topic}: {status} {text}"
            )));
        }
        tracing::debug!(topic = %topic, "Message published");
        Ok(())
    }
}
