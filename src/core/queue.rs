//! Serializer: the rule-application work queue
//!
//! [`RuleQueue`] admits requests from any number of callers and runs them
//! one at a time, in the order `submit` was called, across all categories.
//! At most one plan is executing at any instant; everyone else waits in the
//! backlog.
//!
//! ```text
//! submit ──► synthesize ──► push_back ──► (idle?) spawn drain task
//!                                              │
//!                  ┌───────────────────────────┘
//!                  ▼
//!            pop_front ──► execute ──► reply ──► pop_front ... (empty: idle)
//! ```
//!
//! Requests are synthesized at admission, so a request that cannot be turned
//! into commands is rejected by `submit` and never reaches the executor.
//! A failed request never stops the queue: its error goes to its own
//! continuation and the next request starts.
//!
//! There is no cancellation and no timeout on this path. A hung iptables
//! process holds the queue until it exits.

use crate::config::AppConfig;
use crate::core::command::CommandPlan;
use crate::core::error::{Error, Result};
use crate::core::executor::{ApplyReport, CommandRunner, Executor, ProcessRunner};
use crate::core::rule::{
    DhcpMasquerade, DiagHttpRedirect, DnsRedirect, HostAcl, PortForward, RuleChangeRequest,
    Verdict,
};
use crate::core::synthesizer::Synthesizer;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use std::collections::VecDeque;
use std::future::{Future, IntoFuture};
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Continuation invoked exactly once with a request's result
pub type Completion = Box<dyn FnOnce(Result<ApplyReport>) + Send + 'static>;

enum Reply {
    Channel(oneshot::Sender<Result<ApplyReport>>),
    Callback(Completion),
}

impl Reply {
    fn send(self, result: Result<ApplyReport>) {
        match self {
            // Receiver dropped means the caller stopped waiting; the request
            // still ran
            Reply::Channel(tx) => {
                let _ = tx.send(result);
            }
            Reply::Callback(callback) => {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    warn!("Completion callback panicked");
                }
            }
        }
    }
}

struct Job {
    id: Uuid,
    plan: CommandPlan,
    submitted_at: DateTime<Utc>,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: bool,
}

struct Shared<R> {
    state: Mutex<QueueState>,
    synthesizer: Synthesizer,
    executor: Executor<R>,
}

impl<R> Shared<R> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a submitted request. Await it for the request's result.
#[must_use = "a ticket does nothing unless awaited; the request runs either way"]
pub struct Ticket {
    id: Uuid,
    rx: oneshot::Receiver<Result<ApplyReport>>,
}

impl Ticket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl IntoFuture for Ticket {
    type Output = Result<ApplyReport>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.rx.await.unwrap_or_else(|_| Err(Error::QueueClosed)) })
    }
}

/// Serialized, single-flight rule application.
///
/// Cloning yields another handle to the same queue. Submitting requires a
/// running tokio runtime; the backlog is drained by a task spawned on it.
pub struct RuleQueue<R: CommandRunner = ProcessRunner> {
    shared: Arc<Shared<R>>,
}

impl<R: CommandRunner> Clone for RuleQueue<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl RuleQueue<ProcessRunner> {
    /// Builds a queue that spawns real iptables processes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Elevation` if the configured launcher is unavailable,
    /// `Error::Validation` if the config is unusable.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|message| Error::validation("config", message))?;
        let prefix = crate::elevation::resolve_prefix(config.elevation)?;
        let synthesizer = Synthesizer::from_config(config, prefix);
        let executor = Executor::new(ProcessRunner::new()).with_mode(config.script_mode);
        Ok(Self::new(synthesizer, executor))
    }
}

impl<R: CommandRunner> RuleQueue<R> {
    pub fn new(synthesizer: Synthesizer, executor: Executor<R>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                synthesizer,
                executor,
            }),
        }
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.shared.synthesizer
    }

    pub fn executor(&self) -> &Executor<R> {
        &self.shared.executor
    }

    /// Synthesizes a request without queueing or running it
    pub fn plan(&self, request: &RuleChangeRequest) -> Result<CommandPlan> {
        self.shared.synthesizer.plan(request)
    }

    /// Queues a request and returns a ticket for its result.
    ///
    /// The request is taken by value, so later changes on the caller's side
    /// cannot affect what runs.
    ///
    /// # Errors
    ///
    /// `Error::Validation` if the request cannot be synthesized. Nothing is
    /// queued in that case.
    pub fn submit(&self, request: RuleChangeRequest) -> Result<Ticket> {
        let (tx, rx) = oneshot::channel();
        let id = request.id;
        self.enqueue(&request, Reply::Channel(tx))?;
        Ok(Ticket { id, rx })
    }

    /// Queues a request whose result is delivered to `callback`.
    ///
    /// The callback runs on the queue's drain task, before the next request
    /// starts.
    ///
    /// # Errors
    ///
    /// As for [`submit`](Self::submit); the callback is not invoked then.
    pub fn submit_with_callback<F>(&self, request: RuleChangeRequest, callback: F) -> Result<Uuid>
    where
        F: FnOnce(Result<ApplyReport>) + Send + 'static,
    {
        let id = request.id;
        self.enqueue(&request, Reply::Callback(Box::new(callback)))?;
        Ok(id)
    }

    /// Submits and waits for the result
    pub async fn apply(&self, request: RuleChangeRequest) -> Result<ApplyReport> {
        self.submit(request)?.await
    }

    /// Number of requests waiting behind the one in flight
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Whether a request is executing or queued
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Host ACL with an `ACCEPT` verdict
    pub async fn allow(&self, acl: HostAcl, elevated: bool) -> Result<ApplyReport> {
        self.host_verdict(acl, Verdict::Accept, elevated).await
    }

    /// Host ACL with a `DROP` verdict
    pub async fn drop(&self, acl: HostAcl, elevated: bool) -> Result<ApplyReport> {
        self.host_verdict(acl, Verdict::Drop, elevated).await
    }

    /// Host ACL with a `REJECT` verdict
    pub async fn reject(&self, acl: HostAcl, elevated: bool) -> Result<ApplyReport> {
        self.host_verdict(acl, Verdict::Reject, elevated).await
    }

    async fn host_verdict(
        &self,
        acl: HostAcl,
        verdict: Verdict,
        elevated: bool,
    ) -> Result<ApplyReport> {
        let acl = HostAcl {
            target: Some(verdict),
            ..acl
        };
        self.apply(RuleChangeRequest::new(acl.into()).elevated(elevated))
            .await
    }

    pub async fn port_forward(&self, pf: PortForward) -> Result<ApplyReport> {
        self.apply(RuleChangeRequest::new(pf.into())).await
    }

    /// Redirects DNS (tcp and udp port 53) from `src` to `dns`, or removes
    /// the redirect when `state` is false
    pub async fn dns_change(
        &self,
        src: IpNetwork,
        dns: impl Into<String>,
        state: bool,
    ) -> Result<ApplyReport> {
        let change = DnsRedirect {
            ip: src,
            dns: dns.into(),
            state,
        };
        self.apply(RuleChangeRequest::new(change.into())).await
    }

    pub async fn dhcp_subnet_change(&self, cidr: IpNetwork, state: bool) -> Result<ApplyReport> {
        let change = DhcpMasquerade { ip: cidr, state };
        self.apply(RuleChangeRequest::new(change.into())).await
    }

    pub async fn diag_http_change(&self, ip: IpAddr, state: bool) -> Result<ApplyReport> {
        let change = DiagHttpRedirect { ip, state };
        self.apply(RuleChangeRequest::new(change.into())).await
    }

    fn enqueue(&self, request: &RuleChangeRequest, reply: Reply) -> Result<()> {
        let plan = self.shared.synthesizer.plan(request)?;
        let job = Job {
            id: request.id,
            plan,
            submitted_at: Utc::now(),
            reply,
        };

        let start_drain = {
            let mut state = self.shared.lock();
            state.pending.push_back(job);
            debug!(
                "[{}] queued {} (pending: {}, running: {})",
                request.category().log_tag(),
                request.id,
                state.pending.len(),
                state.running
            );
            !std::mem::replace(&mut state.running, true)
        };

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
        Ok(())
    }
}

/// Runs queued jobs until the backlog is empty, then marks the queue idle.
///
/// Only one drain task exists at a time: it is spawned by the submit that
/// flips `running` to true, and `running` is cleared under the same lock that
/// observes the empty backlog.
///
/// Each execution runs in its own task. A panic there fails only that
/// request; the loop itself never unwinds with `running` still set.
async fn drain<R: CommandRunner>(shared: Arc<Shared<R>>) {
    loop {
        let job = {
            let mut state = shared.lock();
            match state.pending.pop_front() {
                Some(job) => job,
                None => {
                    state.running = false;
                    debug!("Rule queue idle");
                    return;
                }
            }
        };

        let Job {
            id,
            plan,
            submitted_at,
            reply,
        } = job;
        debug!("Running request {id}");

        let worker = Arc::clone(&shared);
        let handle =
            tokio::spawn(async move { worker.executor.execute(id, &plan, submitted_at).await });
        let result = handle.await.unwrap_or_else(|e| {
            warn!("[{id}] execution aborted: {e}");
            Err(Error::Internal(format!("execution of request {id} aborted: {e}")))
        });
        reply.send(result);
    }
}
