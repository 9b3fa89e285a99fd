//! Transaction router
//!
//! One [`Router`] process drives one transaction through an ordered sequence of
//! server kinds. Every hop picks the least loaded server of its pool, races the
//! grant against a per-hop deadline, emits one record and then holds the grant
//! for the latency the server had when the grant was handed out. Service time
//! itself is bounded only by the transaction timeout.
//!
//! # Route record
//!
//! Completed hops are kept as [`RouteEntry`]s, each still holding its grant. A
//! kind that reappears in the sequence reuses the grant of its first occurrence
//! instead of queueing again; once that hop is served, every entry recorded
//! after the first occurrence is released and dropped. A transaction therefore
//! never holds more grants than it has distinct kinds.
//!
//! # Failure
//!
//! Unknown kinds, exhausted pools, hop deadlines and interrupts other than a
//! preemption end the transaction with an error record. A preempted grant on
//! the hop in progress excludes that server and retries the hop elsewhere, up
//! to `max_reroutes` times. Whatever the outcome, teardown releases every grant
//! the router still owns before the process finishes.

use std::rc::Rc;

use log::debug;
use rand::Rng;

use crate::qn_interface::{
    EventRecord, GrantId, Priority, ServerId, SimTime, TransactionId, CLIENT, DEFAULT_PRIORITY,
};
use crate::qn_process::{Interrupt, Process, Suspend, Wait, Wake};
use crate::qn_scheduler::Context;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("unknown server kind {0}")]
    UnknownKind(String),

    #[error("no {0} server available")]
    NoServerAvailable(String),
}

/// Settings shared by every router of one simulation
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub kinds: Vec<String>,
    pub priority: Priority,
    /// how long one hop may wait for its grant
    pub hop_timeout: f64,
    pub max_reroutes: usize,
    /// relative latency perturbation, 0 disables it
    pub latency_jitter: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            kinds: vec!["regular".to_string()],
            priority: DEFAULT_PRIORITY,
            hop_timeout: 1.0,
            max_reroutes: 1,
            latency_jitter: 0.0,
        }
    }
}

/// One served hop still holding its grant
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub kind: String,
    pub server: ServerId,
    pub server_name: String,
    pub grant: GrantId,
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Start,
    /// waiting for a freshly requested grant
    Granting {
        server: ServerId,
        server_name: String,
        grant: GrantId,
        deadline: SimTime,
    },
    /// holding the grant for the service latency
    Serving {
        server: ServerId,
        server_name: String,
        grant: GrantId,
        reused: bool,
        service_end: SimTime,
    },
    Finished,
}

pub struct Router {
    name: String,
    transaction: TransactionId,
    config: Rc<RouteConfig>,
    hop: usize,
    route: Vec<RouteEntry>,
    excluded: Vec<ServerId>,
    reroutes: usize,
    // server name of the previous hop, CLIENT before the first
    requester: String,
    requester_kind: String,
    stage: Stage,
}

impl Router {
    pub fn new(transaction: TransactionId, config: Rc<RouteConfig>) -> Self {
        Self {
            name: format!("router-{:016x}", transaction),
            transaction,
            config,
            hop: 0,
            route: Vec::new(),
            excluded: Vec::new(),
            reroutes: 0,
            requester: CLIENT.to_string(),
            requester_kind: CLIENT.to_string(),
            stage: Stage::Start,
        }
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn route(&self) -> &[RouteEntry] {
        &self.route
    }

    fn current_kind(&self) -> &str {
        &self.config.kinds[self.hop]
    }

    /// The grant of the hop in progress, if it is not yet in the route record
    fn in_flight(&self) -> Option<GrantId> {
        match &self.stage {
            Stage::Granting { grant, .. } => Some(*grant),
            Stage::Serving {
                grant,
                reused: false,
                ..
            } => Some(*grant),
            _ => None,
        }
    }

    fn stage_server(&self) -> Option<&str> {
        match &self.stage {
            Stage::Granting { server_name, .. } | Stage::Serving { server_name, .. } => {
                Some(server_name)
            }
            _ => None,
        }
    }

    fn start_hop(&mut self, ctx: &mut Context<'_>) -> Suspend {
        if self.hop >= self.config.kinds.len() {
            return self.teardown(ctx);
        }

        let kind = self.current_kind().to_string();
        let deadline = ctx.now() + self.config.hop_timeout;

        // loop back to a kind this transaction already holds
        if let Some(entry) = self.route.iter().find(|e| e.kind == kind).cloned() {
            return self.serve(ctx, entry.server, entry.server_name, entry.grant, true);
        }

        let pool = match ctx.registry().pool_for(&kind) {
            Some(pool) => pool,
            None => return self.fail(ctx, &RouteError::UnknownKind(kind).to_string()),
        };
        let server = match pool.select(&self.excluded) {
            Some(server) => server,
            None => return self.fail(ctx, &RouteError::NoServerAvailable(kind).to_string()),
        };
        let server_name = pool
            .server(server.index)
            .map(|s| s.name().to_string())
            .unwrap_or_default();

        let grant = match ctx.request(server, self.config.priority) {
            Some(grant) => grant,
            None => return self.fail(ctx, &RouteError::NoServerAvailable(kind).to_string()),
        };

        self.stage = Stage::Granting {
            server,
            server_name,
            grant,
            deadline,
        };
        Suspend::AnyOf(vec![
            Wait::Grant(grant),
            Wait::Delay(self.config.hop_timeout),
        ])
    }

    fn serve(
        &mut self,
        ctx: &mut Context<'_>,
        server: ServerId,
        server_name: String,
        grant: GrantId,
        reused: bool,
    ) -> Suspend {
        // load as it was when the grant was handed out
        let metrics = ctx
            .granted_metrics(grant)
            .or_else(|| ctx.server(server).map(|s| s.utilization()))
            .unwrap_or_default();

        let now = ctx.now();
        let record = EventRecord::info(
            now,
            &self.requester,
            format!("Requesting {} by {}", self.current_kind(), self.requester_kind),
        )
        .with_metrics(metrics)
        .with_transaction(self.transaction)
        .with_server(&server_name);
        ctx.emit(record);

        let mut latency = metrics.latency;
        if self.config.latency_jitter > 0.0 {
            let jitter = self.config.latency_jitter;
            latency *= 1.0 + ctx.rng().gen_range(-jitter..=jitter);
        }
        let latency = latency.max(0.0);

        let service_end = now + latency;
        self.stage = Stage::Serving {
            server,
            server_name,
            grant,
            reused,
            service_end,
        };
        Suspend::sleep(latency)
    }

    fn complete_hop(&mut self, ctx: &mut Context<'_>) -> Suspend {
        let Stage::Serving {
            server,
            server_name,
            grant,
            reused,
            ..
        } = std::mem::replace(&mut self.stage, Stage::Start)
        else {
            return self.teardown(ctx);
        };

        if reused {
            // release everything recorded after the first occurrence
            if let Some(first) = self.route.iter().position(|e| e.grant == grant) {
                for entry in self.route.split_off(first + 1) {
                    if let Err(e) = ctx.release(entry.grant) {
                        debug!("{} compaction release of {}: {}", self.name, entry.server_name, e);
                    }
                }
            }
        } else {
            self.route.push(RouteEntry {
                kind: self.current_kind().to_string(),
                server,
                server_name: server_name.clone(),
                grant,
            });
        }

        self.requester = server_name;
        self.requester_kind = self.current_kind().to_string();
        self.hop += 1;
        self.reroutes = 0;
        self.excluded.clear();
        self.start_hop(ctx)
    }

    fn on_interrupt(&mut self, ctx: &mut Context<'_>, cause: Interrupt) -> Suspend {
        let (grant, server) = match cause {
            Interrupt::Preempted { grant, server } => (grant, server),
            other => return self.fail(ctx, &other.to_string()),
        };

        let current = match &self.stage {
            Stage::Granting { grant: g, .. } | Stage::Serving { grant: g, .. } => *g == grant,
            _ => false,
        };

        let server_name = ctx
            .server(server)
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        self.emit_error(ctx, Some(&server_name), "preempted");
        self.route.retain(|e| e.grant != grant);

        if !current {
            // an earlier hop lost its grant; keep waiting on the current one
            return self.rearm(ctx);
        }

        self.stage = Stage::Start;
        self.excluded.push(server);
        if self.reroutes >= self.config.max_reroutes {
            let kind = self.current_kind().to_string();
            return self.fail(ctx, &RouteError::NoServerAvailable(kind).to_string());
        }
        self.reroutes += 1;
        debug!("{} rerouting hop {} away from {}", self.name, self.hop, server_name);
        self.start_hop(ctx)
    }

    fn rearm(&mut self, ctx: &mut Context<'_>) -> Suspend {
        let now = ctx.now();
        match &self.stage {
            Stage::Granting {
                grant, deadline, ..
            } => Suspend::AnyOf(vec![Wait::Grant(*grant), Wait::Delay(*deadline - now)]),
            Stage::Serving { service_end, .. } => Suspend::sleep(*service_end - now),
            Stage::Start => self.start_hop(ctx),
            Stage::Finished => Suspend::Done,
        }
    }

    fn emit_error(&self, ctx: &mut Context<'_>, server: Option<&str>, cause: &str) {
        let mut record = EventRecord::error(ctx.now(), &self.requester, format!("Error due to {}", cause))
            .with_transaction(self.transaction);
        if let Some(server) = server {
            record = record.with_server(server);
        }
        ctx.emit(record);
    }

    fn fail(&mut self, ctx: &mut Context<'_>, cause: &str) -> Suspend {
        let server = self.stage_server().map(str::to_string);
        self.emit_error(ctx, server.as_deref(), cause);
        self.teardown(ctx)
    }

    /// Release everything still owned. Runs on every exit path.
    fn teardown(&mut self, ctx: &mut Context<'_>) -> Suspend {
        let mut grants: Vec<GrantId> = self.route.drain(..).map(|e| e.grant).collect();
        grants.extend(self.in_flight());
        // preempted grants whose interrupt is still queued
        grants.retain(|grant| ctx.owns(*grant));

        let held = grants.len();
        let released = grants
            .into_iter()
            .filter(|grant| ctx.release(*grant).is_ok())
            .count();
        ctx.note_teardown(held, released);

        self.stage = Stage::Finished;
        Suspend::Done
    }
}

impl Process for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Suspend {
        match wake {
            Wake::Start => self.start_hop(ctx),
            Wake::Interrupted(cause) => self.on_interrupt(ctx, cause),
            Wake::Fired { index, .. } => match &self.stage {
                Stage::Granting {
                    server,
                    server_name,
                    grant,
                    ..
                } if index == 0 => {
                    let (server, server_name, grant) = (*server, server_name.clone(), *grant);
                    self.serve(ctx, server, server_name, grant, false)
                }
                // the hop deadline won the race for the grant
                Stage::Granting { .. } => self.fail(ctx, &Interrupt::Timeout.to_string()),
                Stage::Serving { .. } => self.complete_hop(ctx),
                Stage::Start => self.start_hop(ctx),
                Stage::Finished => Suspend::Done,
            },
        }
    }
}
