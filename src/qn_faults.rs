//! Fault injection
//!
//! A [`FaultInjector`] repeatedly takes one server out of service: after a
//! random quiet period it requests the server's full capacity at
//! [`FAULT_PRIORITY`], which evicts ordinary traffic, optionally slows the
//! server down, and gives everything back after a random outage duration.

use log::{debug, warn};
use rand::Rng;

use crate::qn_interface::{EventRecord, GrantId, Priority, ServerId};
use crate::qn_process::{Process, Suspend, Wake};
use crate::qn_scheduler::Context;

/// More urgent than any transaction
pub const FAULT_PRIORITY: Priority = 0;

/// Requester name on fault records
pub const FAULT: &str = "fault";

#[derive(Debug, Clone, PartialEq)]
pub struct FaultPlan {
    pub kind: String,
    pub server_index: usize,
    /// quiet period between outages, drawn uniformly
    pub wait: (f64, f64),
    /// outage length, drawn uniformly
    pub duration: (f64, f64),
    /// latency multiplier while the outage lasts
    pub slow_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Quiet,
    Outage { server: ServerId, grants: Vec<GrantId> },
}

pub struct FaultInjector {
    name: String,
    plan: FaultPlan,
    phase: Phase,
    outages: u64,
}

impl FaultInjector {
    pub fn new(plan: FaultPlan) -> Self {
        Self {
            name: format!("fault-{}#{}", plan.kind, plan.server_index),
            plan,
            phase: Phase::Quiet,
            outages: 0,
        }
    }

    pub fn outages(&self) -> u64 {
        self.outages
    }

    fn quiet(&mut self, ctx: &mut Context<'_>) -> Suspend {
        self.phase = Phase::Quiet;
        let delay = uniform(ctx, self.plan.wait);
        Suspend::sleep(delay)
    }

    fn start_outage(&mut self, ctx: &mut Context<'_>) -> Suspend {
        let target = ctx.registry().pool_for(&self.plan.kind).and_then(|pool| {
            pool.server(self.plan.server_index)
                .map(|s| (s.id(), s.capacity(), s.name().to_string()))
        });
        let Some((server, capacity, server_name)) = target else {
            warn!("{}: no such server, giving up", self.name);
            return Suspend::Done;
        };

        let grants: Vec<GrantId> = (0..capacity)
            .filter_map(|_| ctx.request(server, FAULT_PRIORITY))
            .collect();
        if let Some(factor) = self.plan.slow_factor {
            ctx.degrade_server(server, factor);
        }
        self.outages += 1;

        let now = ctx.now();
        ctx.emit(
            EventRecord::error(now, FAULT, format!("Error due to outage on {}", server_name))
                .with_server(&server_name),
        );
        debug!("{} {} seized {} units", now, self.name, grants.len());

        self.phase = Phase::Outage { server, grants };
        let duration = uniform(ctx, self.plan.duration);
        Suspend::sleep(duration)
    }

    fn end_outage(&mut self, ctx: &mut Context<'_>) {
        let Phase::Outage { server, grants } = std::mem::replace(&mut self.phase, Phase::Quiet) else {
            return;
        };

        // units still queued behind another outage are withdrawn
        for grant in grants {
            if let Err(e) = ctx.release(grant) {
                debug!("{} release: {}", self.name, e);
            }
        }
        ctx.restore_server(server);

        let Some(metrics) = ctx.server(server).map(|s| s.utilization()) else {
            return;
        };
        let server_name = ctx
            .server(server)
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        let now = ctx.now();
        ctx.emit(
            EventRecord::info(now, FAULT, format!("Recovered {}", server_name))
                .with_metrics(metrics)
                .with_server(&server_name),
        );
    }
}

fn uniform(ctx: &mut Context<'_>, (min, max): (f64, f64)) -> f64 {
    if max > min {
        ctx.rng().gen_range(min..max)
    } else {
        min
    }
}

impl Process for FaultInjector {
    fn name(&self) -> &str {
        &self.name
    }

    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Suspend {
        match wake {
            Wake::Start => self.quiet(ctx),
            Wake::Interrupted(_) => {
                self.end_outage(ctx);
                Suspend::Done
            }
            Wake::Fired { .. } => match self.phase {
                Phase::Quiet => self.start_outage(ctx),
                Phase::Outage { .. } => {
                    self.end_outage(ctx);
                    self.quiet(ctx)
                }
            },
        }
    }
}
