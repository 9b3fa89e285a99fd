// Arrival generator: spawns one router per arrival at seasonality scaled gaps

use std::rc::Rc;

use log::debug;
use rand::Rng;
use serde::Deserialize;

use crate::qn_interface::ProcessId;
use crate::qn_process::{Interrupt, Process, Suspend, Wait, Wake};
use crate::qn_router::{RouteConfig, Router};
use crate::qn_scheduler::Context;
use crate::qn_seasonality::SeasonalityTable;

/// How arrivals relate to the transactions they start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorMode {
    /// Keep generating while earlier transactions are in flight; each one is
    /// interrupted by its own timeout callback.
    #[default]
    Overlapping,
    /// Wait for each transaction (or its timeout) before the next gap.
    Sequential,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// gap at scale 1.0, i.e. `1 / max_volume`
    pub base_interval: f64,
    pub transaction_timeout: f64,
    pub mode: GeneratorMode,
    /// stop after this many arrivals
    pub max_arrivals: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_interval: 1.0 / 1000.0,
            transaction_timeout: 1.0,
            mode: GeneratorMode::Overlapping,
            max_arrivals: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Sleeping,
    Awaiting(ProcessId),
}

pub struct ArrivalGenerator {
    config: GeneratorConfig,
    route: Rc<RouteConfig>,
    seasonality: Rc<SeasonalityTable>,
    phase: Phase,
    arrivals: u64,
}

impl ArrivalGenerator {
    pub fn new(config: GeneratorConfig, route: Rc<RouteConfig>, seasonality: Rc<SeasonalityTable>) -> Self {
        Self {
            config,
            route,
            seasonality,
            phase: Phase::Sleeping,
            arrivals: 0,
        }
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals
    }

    fn next_gap(&mut self, ctx: &mut Context<'_>) -> Suspend {
        self.phase = Phase::Sleeping;
        if self
            .config
            .max_arrivals
            .is_some_and(|limit| self.arrivals >= limit)
        {
            return Suspend::Done;
        }

        let gap = self
            .seasonality
            .interval_at(ctx.now().as_f64(), self.config.base_interval);
        Suspend::sleep(gap)
    }

    fn arrive(&mut self, ctx: &mut Context<'_>) -> Suspend {
        let transaction: u64 = ctx.rng().gen();
        let pid = ctx.spawn(Box::new(Router::new(transaction, self.route.clone())));
        self.arrivals += 1;
        debug!("{} arrival {} -> #{}", ctx.now(), self.arrivals, pid);

        let timeout = self.config.transaction_timeout;
        match self.config.mode {
            GeneratorMode::Overlapping => {
                if timeout.is_finite() {
                    ctx.schedule_after(timeout, move |ctx| {
                        if ctx.is_alive(pid) {
                            ctx.interrupt(pid, Interrupt::Timeout);
                        }
                    });
                }
                self.next_gap(ctx)
            }
            GeneratorMode::Sequential => {
                self.phase = Phase::Awaiting(pid);
                Suspend::AnyOf(vec![
                    Wait::Process(pid),
                    Wait::Delay(timeout),
                ])
            }
        }
    }
}

impl Process for ArrivalGenerator {
    fn name(&self) -> &str {
        "generator"
    }

    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Suspend {
        match (wake, self.phase) {
            (Wake::Start, _) => self.next_gap(ctx),
            (Wake::Interrupted(_), _) => Suspend::Done,
            (Wake::Fired { .. }, Phase::Sleeping) => self.arrive(ctx),
            (Wake::Fired { index, .. }, Phase::Awaiting(pid)) => {
                if index == 1 && ctx.is_alive(pid) {
                    ctx.interrupt(pid, Interrupt::Timeout);
                }
                self.next_gap(ctx)
            }
        }
    }
}
