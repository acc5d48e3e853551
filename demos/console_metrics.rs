//! Runs a couple of jobs through an in-memory worker with `TracingObserver`
//! wired in, so every lifecycle hook prints a structured log line.

use std::sync::Arc;

use jobq::{
    registry::Job, worker::WorkerConfig, MemoryBackend, Observer, QueueBackend, Registry,
    TracingObserver, Worker,
};
use serde_json::{json, Value};

#[derive(Debug, Default)]
struct Greet {
    name: String,
}

impl Job for Greet {
    const NAME: &'static str = "Greet";

    fn handle(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        println!("hello, {}!", self.name);
        Ok(())
    }

    fn to_data(&self) -> Value {
        json!({ "name": self.name })
    }

    fn from_data(data: &Value) -> Self {
        Greet {
            name: data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Explode;

impl Job for Explode {
    const NAME: &'static str = "Explode";
    const DEFAULT_MAX_TRIES: u32 = 2;

    fn handle(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("simulated failure".into())
    }

    fn to_data(&self) -> Value {
        json!({})
    }

    fn from_data(_data: &Value) -> Self {
        Explode
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobq::tracing_config::configure("console_metrics");

    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
    let mut registry = Registry::new();
    registry.register::<Greet>()?;
    registry.register::<Explode>()?;

    let worker = Worker::new("demo", backend, Arc::new(registry), WorkerConfig::default())
        .with_observer(Arc::new(TracingObserver) as Arc<dyn Observer>);

    worker
        .push(
            Greet {
                name: "world".to_string(),
            },
            None,
        )
        .await?;
    worker.push(Explode, None).await?;

    while worker.do_one().await? {}

    Ok(())
}
