use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::{runtime::Runtime, task::JoinHandle};

type PendingPublishes = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Telemetry builder for the AFSIM services.
pub struct ServiceTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    logger: Option<Arc<JsonLogger>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ServiceTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            logger: None,
            event_publisher: None,
        }
    }

    /// Opens a dedicated JSON log file.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Shares an already opened logger.
    #[must_use]
    pub fn logger(mut self, logger: Arc<JsonLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds telemetry. A shared logger wins over `log_path`.
    pub fn build(self) -> Result<ServiceTelemetry> {
        let logger = match (self.logger, self.log_path) {
            (Some(logger), _) => Some(logger),
            (None, Some(path)) => Some(Arc::new(JsonLogger::new(path)?)),
            (None, None) => None,
        };
        Ok(ServiceTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
                pending: PendingPublishes::default(),
            }),
        })
    }
}

/// Telemetry handle shared by a service and its clones.
#[derive(Clone)]
pub struct ServiceTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ServiceTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.is_some())
            .field("events", &self.inner.publisher.is_some())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    pending: PendingPublishes,
}

impl ServiceTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ServiceTelemetryBuilder {
        ServiceTelemetryBuilder::new(module)
    }

    /// Same sinks under another module label.
    #[must_use]
    pub fn scoped(&self, module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                logger: self.inner.logger.clone(),
                publisher: self.inner.publisher.clone(),
                pending: Arc::clone(&self.inner.pending),
            }),
        }
    }

    /// Module label.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs a dotted message with object metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            if !logger.enabled(level) {
                return Ok(());
            }
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Value::Object(obj) = metadata {
                record.metadata = obj;
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes an event.
    ///
    /// Inside a tokio runtime the publish is spawned and tracked until
    /// [`flush`](Self::flush); otherwise it blocks on a private runtime.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(self.inner.module.clone(), event_type, payload);
        if tokio::runtime::Handle::try_current().is_ok() {
            let publisher = Arc::clone(publisher);
            let handle = tokio::spawn(async move {
                let _ = publisher.publish(record).await;
            });
            let mut pending = self.inner.pending.lock();
            pending.retain(|task| !task.is_finished());
            pending.push(handle);
            Ok(())
        } else {
            Runtime::new()?.block_on(publisher.publish(record))
        }
    }

    /// Waits for every spawned publish, including those of scoped copies.
    ///
    /// Must run before the owning runtime is dropped, which would cancel them.
    pub async fn flush(&self) {
        loop {
            let batch = std::mem::take(&mut *self.inner.pending.lock());
            if batch.is_empty() {
                return;
            }
            for task in batch {
                let _ = task.await;
            }
        }
    }
}
