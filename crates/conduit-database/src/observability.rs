//! Query instrumentation.
//!
//! Every statement issued through an executor passes through
//! [`ObservabilityPlugin::before`] and [`ObservabilityPlugin::after`]. The
//! guard returned by `before` carries the start instant and the trace span,
//! so the pair needs no shared per-operation state.

use crate::error::{DatabaseError, DbResult};
use crate::statement::Statement;
use conduit_config::{ConfigResult, ObservabilityConfig};
use parking_lot::RwLock;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::field::Empty;

/// Structured key/value attached to a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: &'static str,
    pub value: String,
}

impl Field {
    pub fn new(key: &'static str, value: impl fmt::Display) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

/// Structured logger the plugin reports through.
pub trait QueryLogger: Send + Sync {
    fn debug(&self, message: &str, fields: &[Field]);
    fn info(&self, message: &str, fields: &[Field]);
    fn warn(&self, message: &str, fields: &[Field]);
    fn error(&self, message: &str, fields: &[Field]);
}

/// A span opened for one sampled operation.
pub trait TraceSpan: Send {
    fn record_error(&mut self, error: &(dyn std::error::Error + 'static));
    fn end(self: Box<Self>);
}

/// Opens spans for sampled operations.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, table: &str) -> Box<dyn TraceSpan>;
}

/// Keys [`TracingLogger`] emits as first-class `tracing` fields.
const KNOWN_KEYS: [&str; 5] = ["table", "operation", "duration_ms", "sql", "error"];

fn lookup<'a>(fields: &'a [Field], key: &str) -> Option<&'a str> {
    fields.iter().find(|f| f.key == key).map(|f| f.value.as_str())
}

/// Fields outside [`KNOWN_KEYS`], rendered as `key=value` pairs.
fn extra(fields: &[Field]) -> Option<String> {
    let rest: Vec<String> = fields
        .iter()
        .filter(|f| !KNOWN_KEYS.contains(&f.key))
        .map(|f| format!("{}={}", f.key, f.value))
        .collect();
    (!rest.is_empty()).then(|| rest.join(" "))
}

macro_rules! emit {
    ($level:ident, $message:expr, $fields:expr) => {{
        let fields: &[Field] = $fields;
        tracing::$level!(
            target: "conduit::query",
            table = lookup(fields, "table"),
            operation = lookup(fields, "operation"),
            duration_ms = lookup(fields, "duration_ms").and_then(|v| v.parse::<u64>().ok()),
            sql = lookup(fields, "sql"),
            error = lookup(fields, "error"),
            extra = extra(fields).as_deref(),
            "{}",
            $message
        );
    }};
}

/// Forwards to `tracing` under the `conduit::query` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl QueryLogger for TracingLogger {
    fn debug(&self, message: &str, fields: &[Field]) {
        emit!(debug, message, fields);
    }

    fn info(&self, message: &str, fields: &[Field]) {
        emit!(info, message, fields);
    }

    fn warn(&self, message: &str, fields: &[Field]) {
        emit!(warn, message, fields);
    }

    fn error(&self, message: &str, fields: &[Field]) {
        emit!(error, message, fields);
    }
}

/// Spans backed by `tracing` spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

struct TracingSpan(tracing::Span);

impl TraceSpan for TracingSpan {
    fn record_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        self.0.record("error", tracing::field::display(error));
    }

    fn end(self: Box<Self>) {}
}

impl Tracer for TracingTracer {
    fn start_span(&self, name: &str, table: &str) -> Box<dyn TraceSpan> {
        let span = tracing::info_span!(
            target: "conduit::query",
            "db",
            otel.name = %name,
            db.table = %table,
            error = Empty
        );
        Box::new(TracingSpan(span))
    }
}

/// State carried from `before` to `after` for a sampled operation.
pub struct OperationGuard {
    started: Instant,
    span: Option<Box<dyn TraceSpan>>,
}

impl OperationGuard {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard")
            .field("started", &self.started)
            .field("traced", &self.span.is_some())
            .finish()
    }
}

struct PluginInner {
    config: RwLock<ObservabilityConfig>,
    logger: Arc<dyn QueryLogger>,
    tracer: Option<Arc<dyn Tracer>>,
}

/// Timing, logging and sampling around every database operation.
///
/// Cheap to clone; clones share configuration.
#[derive(Clone)]
pub struct ObservabilityPlugin {
    inner: Arc<PluginInner>,
}

impl fmt::Debug for ObservabilityPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservabilityPlugin")
            .field("config", &*self.inner.config.read())
            .field("tracer", &self.inner.tracer.is_some())
            .finish()
    }
}

impl Default for ObservabilityPlugin {
    fn default() -> Self {
        Self::new(ObservabilityConfig::default(), Arc::new(TracingLogger), None)
    }
}

impl ObservabilityPlugin {
    pub fn new(
        config: ObservabilityConfig,
        logger: Arc<dyn QueryLogger>,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> Self {
        Self {
            inner: Arc::new(PluginInner {
                config: RwLock::new(config),
                logger,
                tracer,
            }),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ObservabilityConfig {
        self.inner.config.read().clone()
    }

    /// Replace all three settings at once. An out-of-range sample rate is
    /// rejected and nothing changes.
    pub fn set_config(&self, slow_query_threshold: Duration, log_sql: bool, sample_rate: f64) -> ConfigResult<()> {
        self.apply(ObservabilityConfig {
            slow_query_threshold,
            log_sql,
            sample_rate,
        })
    }

    /// Replace the configuration wholesale.
    pub fn apply(&self, config: ObservabilityConfig) -> ConfigResult<()> {
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    fn sampled(sample_rate: f64) -> bool {
        if sample_rate >= 1.0 {
            true
        } else if sample_rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen::<f64>() < sample_rate
        }
    }

    /// Start observing `statement`. Returns `None` when the operation is not
    /// sampled.
    pub fn before(&self, statement: &Statement) -> Option<OperationGuard> {
        let sample_rate = self.inner.config.read().sample_rate;
        if !Self::sampled(sample_rate) {
            return None;
        }

        let span = self
            .inner
            .tracer
            .as_ref()
            .map(|tracer| tracer.start_span(&format!("db.{}", statement.kind), &statement.table));

        Some(OperationGuard {
            started: Instant::now(),
            span,
        })
    }

    /// Finish observing `statement`. A `None` guard is a no-op.
    pub fn after(&self, statement: &Statement, guard: Option<OperationGuard>, error: Option<&DatabaseError>) {
        let Some(guard) = guard else { return };
        let elapsed = guard.started.elapsed();
        let config = self.config();
        let logger = &self.inner.logger;

        let mut fields = vec![
            Field::new("table", &statement.table),
            Field::new("operation", statement.kind),
            Field::new("duration_ms", elapsed.as_millis()),
        ];
        if config.log_sql {
            fields.push(Field::new("sql", &statement.sql));
        }

        let mut span = guard.span;

        if let Some(err) = error {
            let mut error_fields = fields.clone();
            error_fields.push(Field::new("error", err));
            logger.error("query failed", &error_fields);
            if let Some(span) = span.as_mut() {
                span.record_error(err);
            }
        }

        let threshold = config.slow_query_threshold;
        if !threshold.is_zero() && elapsed >= threshold {
            logger.warn("slow query", &fields);
        }

        if config.log_sql {
            logger.debug("query executed", &fields);
        }

        if let Some(span) = span {
            span.end();
        }
    }

    /// Run `operation` between `before` and `after`.
    pub async fn observe<T, F>(&self, statement: &Statement, operation: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let guard = self.before(statement);
        let result = operation.await;
        self.after(statement, guard, result.as_ref().err());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::OperationKind;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<(&'static str, String, Vec<Field>)>>,
    }

    impl RecordingLogger {
        fn messages(&self, level: &str) -> Vec<String> {
            self.lines
                .lock()
                .iter()
                .filter(|(l, _, _)| *l == level)
                .map(|(_, m, _)| m.clone())
                .collect()
        }

        fn push(&self, level: &'static str, message: &str, fields: &[Field]) {
            self.lines.lock().push((level, message.to_string(), fields.to_vec()));
        }
    }

    impl QueryLogger for RecordingLogger {
        fn debug(&self, message: &str, fields: &[Field]) {
            self.push("debug", message, fields)
        }
        fn info(&self, message: &str, fields: &[Field]) {
            self.push("info", message, fields)
        }
        fn warn(&self, message: &str, fields: &[Field]) {
            self.push("warn", message, fields)
        }
        fn error(&self, message: &str, fields: &[Field]) {
            self.push("error", message, fields)
        }
    }

    #[derive(Default)]
    struct RecordingTracer {
        events: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingSpan {
        name: String,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl TraceSpan for RecordingSpan {
        fn record_error(&mut self, error: &(dyn std::error::Error + 'static)) {
            self.events.lock().push(format!("error {}: {}", self.name, error));
        }

        fn end(self: Box<Self>) {
            self.events.lock().push(format!("end {}", self.name));
        }
    }

    impl Tracer for RecordingTracer {
        fn start_span(&self, name: &str, table: &str) -> Box<dyn TraceSpan> {
            self.events.lock().push(format!("start {} {}", name, table));
            Box::new(RecordingSpan {
                name: name.to_string(),
                events: self.events.clone(),
            })
        }
    }

    fn plugin(config: ObservabilityConfig) -> (ObservabilityPlugin, Arc<RecordingLogger>, Arc<Mutex<Vec<String>>>) {
        let logger = Arc::new(RecordingLogger::default());
        let tracer = RecordingTracer::default();
        let events = tracer.events.clone();
        let plugin = ObservabilityPlugin::new(config, logger.clone(), Some(Arc::new(tracer)));
        (plugin, logger, events)
    }

    fn statement() -> Statement {
        Statement::new(OperationKind::Update, "users", "UPDATE users SET a = ?", vec![])
    }

    #[test]
    fn test_unsampled_does_nothing() {
        let (plugin, logger, events) = plugin(ObservabilityConfig {
            sample_rate: 0.0,
            log_sql: true,
            slow_query_threshold: Duration::ZERO,
        });

        let guard = plugin.before(&statement());
        assert!(guard.is_none());
        plugin.after(&statement(), guard, None);

        assert!(logger.lines.lock().is_empty());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_after_without_guard_is_noop() {
        let (plugin, logger, _) = plugin(ObservabilityConfig::default());
        plugin.after(&statement(), None, Some(&DatabaseError::Timeout));
        assert!(logger.lines.lock().is_empty());
    }

    #[test]
    fn test_sampled_operation_opens_and_ends_span() {
        let (plugin, logger, events) = plugin(ObservabilityConfig::default());

        let guard = plugin.before(&statement());
        assert!(guard.is_some());
        plugin.after(&statement(), guard, None);

        assert_eq!(*events.lock(), vec!["start db.update users", "end db.update"]);
        assert!(logger.messages("debug").is_empty());
        assert!(logger.messages("warn").is_empty());
    }

    #[test]
    fn test_log_sql_emits_debug_with_statement() {
        let (plugin, logger, _) = plugin(ObservabilityConfig {
            log_sql: true,
            ..Default::default()
        });

        let guard = plugin.before(&statement());
        plugin.after(&statement(), guard, None);

        let lines = logger.lines.lock();
        let (_, message, fields) = lines.iter().find(|(l, _, _)| *l == "debug").unwrap();
        assert_eq!(message, "query executed");
        assert!(fields.contains(&Field::new("sql", "UPDATE users SET a = ?")));
        assert!(fields.contains(&Field::new("operation", "update")));
    }

    #[test]
    fn test_slow_query_warns() {
        let (plugin, logger, _) = plugin(ObservabilityConfig {
            slow_query_threshold: Duration::from_millis(5),
            ..Default::default()
        });

        let guard = plugin.before(&statement());
        std::thread::sleep(Duration::from_millis(10));
        plugin.after(&statement(), guard, None);

        assert_eq!(logger.messages("warn"), vec!["slow query"]);
        let lines = logger.lines.lock();
        let (_, _, fields) = &lines[0];
        assert!(fields.iter().any(|f| f.key == "duration_ms"));
        assert!(!fields.iter().any(|f| f.key == "sql"));
    }

    #[test]
    fn test_zero_threshold_disables_slow_log() {
        let (plugin, logger, _) = plugin(ObservabilityConfig {
            slow_query_threshold: Duration::ZERO,
            ..Default::default()
        });

        let guard = plugin.before(&statement());
        std::thread::sleep(Duration::from_millis(2));
        plugin.after(&statement(), guard, None);
        assert!(logger.messages("warn").is_empty());
    }

    #[test]
    fn test_failure_logged_and_recorded_on_span() {
        let (plugin, logger, events) = plugin(ObservabilityConfig::default());

        let guard = plugin.before(&statement());
        plugin.after(&statement(), guard, Some(&DatabaseError::Timeout));

        assert_eq!(logger.messages("error"), vec!["query failed"]);
        assert_eq!(
            *events.lock(),
            vec![
                "start db.update users",
                "error db.update: database operation timed out",
                "end db.update"
            ]
        );
    }

    #[test]
    fn test_set_config_is_all_or_nothing() {
        let plugin = ObservabilityPlugin::default();

        plugin.set_config(Duration::from_secs(1), true, 0.5).unwrap();
        let config = plugin.config();
        assert_eq!(config.slow_query_threshold, Duration::from_secs(1));
        assert!(config.log_sql);
        assert_eq!(config.sample_rate, 0.5);

        assert!(plugin.set_config(Duration::ZERO, false, 2.0).is_err());
        assert_eq!(plugin.config(), config);
    }

    #[test]
    fn test_clones_share_config() {
        let plugin = ObservabilityPlugin::default();
        let clone = plugin.clone();
        clone.set_config(Duration::ZERO, true, 1.0).unwrap();
        assert!(plugin.config().log_sql);
    }

    #[derive(Default, Clone)]
    struct CapturedEvents(Arc<Mutex<Vec<Vec<(String, String)>>>>);

    struct FieldVisitor<'a>(&'a mut Vec<(String, String)>);

    impl tracing::field::Visit for FieldVisitor<'_> {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{:?}", value)));
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            self.0.push((field.name().to_string(), value.to_string()));
        }

        fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
            self.0.push((field.name().to_string(), value.to_string()));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let mut fields = Vec::new();
            event.record(&mut FieldVisitor(&mut fields));
            self.0.lock().push(fields);
        }
    }

    #[test]
    fn test_tracing_logger_emits_structured_fields() {
        use tracing_subscriber::layer::SubscriberExt;

        let events = CapturedEvents::default();
        let subscriber = tracing_subscriber::registry().with(events.clone());
        tracing::subscriber::with_default(subscriber, || {
            TracingLogger.warn(
                "slow query",
                &[
                    Field::new("table", "users"),
                    Field::new("operation", OperationKind::Query),
                    Field::new("duration_ms", 250u128),
                    Field::new("attempt", 2),
                ],
            );
        });

        let events = events.0.lock();
        assert_eq!(events.len(), 1);
        let get = |key: &str| {
            events[0]
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(get("message").as_deref(), Some("slow query"));
        assert_eq!(get("table").as_deref(), Some("users"));
        assert_eq!(get("operation").as_deref(), Some("query"));
        assert_eq!(get("duration_ms").as_deref(), Some("250"));
        assert_eq!(get("extra").as_deref(), Some("attempt=2"));
        assert_eq!(get("sql"), None);
        assert_eq!(get("error"), None);
    }

    #[tokio::test]
    async fn test_observe_passes_result_through() {
        let (plugin, logger, _) = plugin(ObservabilityConfig::default());

        let ok: DbResult<u64> = plugin.observe(&statement(), async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);

        let err: DbResult<u64> = plugin
            .observe(&statement(), async { Err(DatabaseError::Timeout) })
            .await;
        assert!(matches!(err, Err(DatabaseError::Timeout)));
        assert_eq!(logger.messages("error").len(), 1);
    }
}
