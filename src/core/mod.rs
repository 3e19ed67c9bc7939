//! Core engine primitives: time alignment, gap reconciliation, retry,
//! dispatch, the heartbeat and the HTTP surface.

pub mod clock;
pub mod dispatcher;
pub mod http;
pub mod reconciler;
pub mod retry;
pub mod runtime;
pub mod scheduler;

pub use clock::{Clock, SystemClock, TimeAligner, TokioClock};
pub use dispatcher::{is_due, DispatchReport, Dispatcher, RunOutcome, StrategyRun};
pub use reconciler::{BackfillPolicy, FetchPlan, FetchStrategy, FetchWindow, GapReconciler, ReconciliationWarning};
pub use retry::RetryPolicy;
pub use runtime::{RuntimeConfig, RuntimeDeps, SeriesRegistration, SyncRuntime};
pub use scheduler::{BeatHandler, HeartbeatScheduler, HeartbeatStats};
