//! Controller event loop
//!
//! One thread of control serializes the five incoming message streams,
//! chain notifications and the periodic tick into the engine and the state
//! machine. Emission entry points mirror the tick split of the protocol:
//! maybe-prepare, maybe-commit, checkpoint, and the view-change timer
//! inside `ReplicaStateMachine::tick`.

use crate::config::ConsensusConfig;
use crate::engine::ConsensusEngine;
use crate::error::VoteError;
use crate::machine::{Outgoing, ReplicaStateMachine};
use crate::message::{Checkpoint, Commit, NewView, Prepare, ViewChange};
use crate::network::NetworkHandles;
use crate::persistence;
use anyhow::Result;
use keystone_chain::ChainAdapter;
use keystone_core::{BlockId, BlockNum};
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Notifications from the chain adapter's side.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    HeadAdvanced(BlockId),
    IrreversibleAdvanced(BlockNum),
}

pub struct PbftController {
    config: ConsensusConfig,
    engine: ConsensusEngine,
    machine: ReplicaStateMachine,
    net: NetworkHandles,
    chain_events: mpsc::Receiver<ChainEvent>,
    tick_interval: Duration,
    cancellation_token: CancellationToken,
}

impl PbftController {
    /// Build the controller, restoring any snapshot left by a previous
    /// clean shutdown. The snapshot files are deleted on read, so a crash
    /// mid-run starts from an empty state rebuilt off the chain.
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        config: ConsensusConfig,
        net: NetworkHandles,
        chain_events: mpsc::Receiver<ChainEvent>,
    ) -> Self {
        let mut engine = ConsensusEngine::new(chain);
        let mut restored_view = None;

        if let Some(dir) = &config.data_dir {
            match persistence::load_quorum(dir) {
                Ok(Some((records, view))) => {
                    tracing::info!(
                        "restored {} quorum records, current view {}",
                        records.len(),
                        view
                    );
                    engine.restore_quorum(records);
                    restored_view = Some(view);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("quorum snapshot unreadable, starting empty: {}", err);
                }
            }
            match persistence::load_checkpoints(dir) {
                Ok(Some(records)) => {
                    tracing::info!("restored {} checkpoint records", records.len());
                    engine.restore_checkpoints(records);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("checkpoint snapshot unreadable, starting empty: {}", err);
                }
            }
        }

        let initial_view = restored_view.unwrap_or_else(|| engine.committed_view());
        let machine = ReplicaStateMachine::new(
            config.view_change_timeout,
            initial_view,
            config.bp_candidate,
        );

        Self {
            config,
            engine,
            machine,
            net,
            chain_events,
            tick_interval: Duration::from_millis(500),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn machine(&self) -> &ReplicaStateMachine {
        &self.machine
    }

    /// Main event loop. Returns after cancellation, once the shutdown
    /// snapshot has been written.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "pbft controller starting in view {} ({})",
            self.machine.current_view(),
            if self.config.bp_candidate {
                "candidate"
            } else {
                "observer"
            }
        );
        counter!("pbft.controller_started").increment(1);

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(p) = self.net.prepare_in.recv() => {
                    let start = Instant::now();
                    self.handle_prepare(p);
                    histogram!("pbft.event_seconds").record(start.elapsed().as_secs_f64());
                }
                Some(c) = self.net.commit_in.recv() => {
                    let start = Instant::now();
                    self.handle_commit(c);
                    histogram!("pbft.event_seconds").record(start.elapsed().as_secs_f64());
                }
                Some(vc) = self.net.view_change_in.recv() => {
                    let start = Instant::now();
                    self.handle_view_change(vc).await;
                    histogram!("pbft.event_seconds").record(start.elapsed().as_secs_f64());
                }
                Some(nv) = self.net.new_view_in.recv() => {
                    let start = Instant::now();
                    self.handle_new_view(nv);
                    histogram!("pbft.event_seconds").record(start.elapsed().as_secs_f64());
                }
                Some(cp) = self.net.checkpoint_in.recv() => {
                    let start = Instant::now();
                    self.handle_checkpoint(cp);
                    histogram!("pbft.event_seconds").record(start.elapsed().as_secs_f64());
                }
                Some(event) = self.chain_events.recv() => {
                    self.handle_chain_event(event);
                }
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
                _ = self.cancellation_token.cancelled() => {
                    break;
                }
                else => {
                    tracing::warn!("all input streams closed, stopping");
                    break;
                }
            }

            self.engine.record_gauges();
            gauge!("pbft.view").set(self.machine.current_view() as f64);
        }

        self.shutdown();
        Ok(())
    }

    fn count_drop(err: &VoteError) {
        match err {
            VoteError::Malformed(_) => counter!("pbft.malformed_dropped").increment(1),
            VoteError::Stale => counter!("pbft.stale_dropped").increment(1),
            VoteError::OutOfSchedule => counter!("pbft.out_of_schedule_dropped").increment(1),
            VoteError::UnknownBlock => counter!("pbft.unknown_block_dropped").increment(1),
        }
    }

    fn handle_prepare(&mut self, p: Prepare) {
        counter!("pbft.prepares_received").increment(1);
        if !self.engine.should_recv(&p.public_key) {
            counter!("pbft.out_of_schedule_dropped").increment(1);
            return;
        }
        if let Err(err) = self.machine.on_prepare(&p, &mut self.engine) {
            tracing::debug!("prepare from {} dropped: {}", p.public_key.short_id(), err);
            Self::count_drop(&err);
        }
    }

    fn handle_commit(&mut self, c: Commit) {
        counter!("pbft.commits_received").increment(1);
        if !self.engine.should_recv(&c.public_key) {
            counter!("pbft.out_of_schedule_dropped").increment(1);
            return;
        }
        if let Err(err) = self.machine.on_commit(&c, &mut self.engine) {
            tracing::debug!("commit from {} dropped: {}", c.public_key.short_id(), err);
            Self::count_drop(&err);
        }
    }

    async fn handle_view_change(&mut self, vc: ViewChange) {
        counter!("pbft.view_changes_received").increment(1);
        if !self.engine.should_recv(&vc.public_key) {
            counter!("pbft.out_of_schedule_dropped").increment(1);
            return;
        }
        match self.machine.on_view_change(&vc, &mut self.engine) {
            Ok(out) => self.publish(out).await,
            Err(err) => {
                tracing::debug!(
                    "view-change from {} dropped: {}",
                    vc.public_key.short_id(),
                    err
                );
                Self::count_drop(&err);
            }
        }
    }

    fn handle_new_view(&mut self, nv: NewView) {
        counter!("pbft.new_views_received").increment(1);
        if let Err(err) = self.machine.on_new_view(&nv, &mut self.engine) {
            tracing::debug!("new-view for view {} rejected: {}", nv.view, err);
            counter!("pbft.new_views_rejected").increment(1);
        }
    }

    fn handle_checkpoint(&mut self, cp: Checkpoint) {
        counter!("pbft.checkpoints_received").increment(1);
        if !self.engine.should_recv(&cp.public_key) {
            counter!("pbft.out_of_schedule_dropped").increment(1);
            return;
        }
        match self.engine.add_checkpoint(&cp) {
            Ok(_) => self.engine.checkpoint_local(),
            Err(err) => {
                tracing::debug!(
                    "checkpoint from {} dropped: {}",
                    cp.public_key.short_id(),
                    err
                );
                Self::count_drop(&err);
            }
        }
    }

    fn handle_chain_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::HeadAdvanced(id) => {
                self.engine.observe_block(&id);
                self.machine.note_progress();
            }
            ChainEvent::IrreversibleAdvanced(num) => {
                tracing::debug!("chain irreversibility advanced to {}", num);
                self.engine.checkpoint_local();
            }
        }
    }

    async fn handle_tick(&mut self) {
        let start = Instant::now();

        // fork choice follows prepared blocks on every replica, observer
        // or candidate
        let _ = self.engine.should_prepared();

        if self.config.bp_candidate && self.engine.should_send() {
            let out = self.machine.send_prepare(&mut self.engine);
            self.publish(out).await;
            let out = self.machine.send_commit(&mut self.engine);
            self.publish(out).await;

            for cp in self.engine.generate_checkpoints() {
                counter!("pbft.checkpoints_sent").increment(1);
                let _ = self.net.checkpoint_out.send(cp).await;
            }
            self.engine.checkpoint_local();
        }

        let out = self.machine.tick(&mut self.engine);
        self.publish(out).await;

        histogram!("pbft.tick_seconds").record(start.elapsed().as_secs_f64());
    }

    async fn publish(&mut self, out: Vec<Outgoing>) {
        for msg in out {
            match msg {
                Outgoing::Prepare(p) => {
                    counter!("pbft.prepares_sent").increment(1);
                    let _ = self.net.prepare_out.send(p).await;
                }
                Outgoing::Commit(c) => {
                    counter!("pbft.commits_sent").increment(1);
                    let _ = self.net.commit_out.send(c).await;
                }
                Outgoing::ViewChange(vc) => {
                    counter!("pbft.view_changes_sent").increment(1);
                    let _ = self.net.view_change_out.send(vc).await;
                }
                Outgoing::NewView(nv) => {
                    counter!("pbft.new_views_sent").increment(1);
                    let _ = self.net.new_view_out.send(nv).await;
                }
            }
        }
    }

    /// Write the shutdown snapshots. Failures are logged and otherwise
    /// ignored: in-memory state is authoritative and will be rebuilt from
    /// the chain next start.
    fn shutdown(&mut self) {
        tracing::info!("pbft controller shutting down");
        counter!("pbft.controller_stopped").increment(1);
        let Some(dir) = &self.config.data_dir else {
            return;
        };
        if let Err(err) = persistence::store_quorum(
            dir,
            &self.engine.quorum.snapshot(),
            self.machine.current_view(),
        ) {
            tracing::warn!("quorum snapshot not written: {}", err);
        }
        if let Err(err) = persistence::store_checkpoints(dir, &self.engine.checkpoints.snapshot())
        {
            tracing::warn!("checkpoint snapshot not written: {}", err);
        }
    }
}

impl Drop for PbftController {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
