//! Root supervisor (SPEC_FULL.md §4.1): owns every live session actor,
//! links each one so its failure is observable, and converts
//! `ActorTerminated`/`ActorFailed` supervision events into the
//! `stream_sessions_active` gauge's lifecycle. This mirrors the
//! supervision-tree shape used elsewhere in this codebase for
//! per-connection state, where a root actor tracks a child's `ActorCell`
//! and reacts only to events concerning children it actually spawned.

use std::sync::Arc;

use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SupervisionEvent};
use sig_metrics::GatewayMetrics;
use tokio::sync::oneshot;

use crate::actor::{SessionActor, SessionArgs, SessionMsg};

pub enum RootMsg {
    SpawnSession(Box<SessionArgs>, oneshot::Sender<ActorRef<SessionMsg>>),
}

pub struct RootArgs {
    pub metrics: Arc<GatewayMetrics>,
}

pub struct RootState {
    metrics: Arc<GatewayMetrics>,
    children: Vec<ActorCell>,
}

pub struct RootActor;

#[ractor::async_trait]
impl Actor for RootActor {
    type Msg = RootMsg;
    type State = RootState;
    type Arguments = RootArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(RootState {
            metrics: args.metrics,
            children: Vec::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RootMsg::SpawnSession(args, reply) => {
                let session_id = args.session_id.clone();
                match Actor::spawn(None, SessionActor, *args).await {
                    Ok((actor_ref, _join)) => {
                        let child_cell = actor_ref.get_cell();
                        child_cell.link(myself.get_cell());
                        state.children.push(child_cell);
                        state.metrics.session_started();
                        tracing::info!(session_id = %session_id, "session_spawned");
                        let _ = reply.send(actor_ref);
                    }
                    Err(err) => {
                        tracing::error!(session_id = %session_id, error = ?err, "session_spawn_failed");
                        drop(reply);
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if remove_child(&mut state.children, &cell) {
                    tracing::info!(?reason, "session_terminated");
                    state.metrics.session_ended();
                }
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                if remove_child(&mut state.children, &cell) {
                    tracing::warn!(?error, "session_failed");
                    state.metrics.session_ended();
                }
            }
            SupervisionEvent::ActorStarted(_) | SupervisionEvent::ProcessGroupChanged(_) => {}
        }
        Ok(())
    }
}

fn remove_child(children: &mut Vec<ActorCell>, terminated: &ActorCell) -> bool {
    let before = children.len();
    children.retain(|c| c.get_id() != terminated.get_id());
    children.len() != before
}
