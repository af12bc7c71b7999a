//! Bus command handlers.
//!
//! The dispatcher listens on the same bus the scheduler and loader emit to, so
//! anything that is not a known command is ignored.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use skill_core::messages::{
    converse_target, Command, ConverseErrorPayload, ConverseRequest, SkillListEntry,
    SkillListPayload, SkillTarget, StatusEvent,
};
use skill_core::types::TriggerReason;
use skill_core::Message;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::registry::{ConverseStatus, DirectoryLoader};
use crate::scheduler::Scheduler;

/// Target for `skillmanager.activate` that reactivates every skill.
pub const ACTIVATE_ALL: &str = "all";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid payload for {command}: {source}")]
    InvalidPayload {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Everything a handler may touch.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub scheduler: Arc<Scheduler>,
    pub loader: Arc<DirectoryLoader>,
    pub bus: Arc<MessageBus>,
}

type Handler = fn(&CommandContext, &Message) -> Result<()>;

/// Command name to handler, in subscription order.
pub struct CommandTable {
    handlers: Vec<(Command, Handler)>,
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(c, _)| c.as_str()))
            .finish()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        let handlers = Command::ALL
            .into_iter()
            .map(|command| (command, handler_for(command)))
            .collect();
        Self { handlers }
    }

    /// Subscribed command names.
    pub fn subscriptions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|(command, _)| command.as_str())
    }

    /// Run the handler for `msg`. Returns the command handled, or `None` if
    /// the message is not a command.
    pub fn dispatch(&self, ctx: &CommandContext, msg: &Message) -> Result<Option<Command>> {
        let Some((command, handler)) = self
            .handlers
            .iter()
            .find(|(command, _)| command.as_str() == msg.msg_type)
        else {
            return Ok(None);
        };
        debug!(command = command.as_str(), "dispatching command");
        handler(ctx, msg)?;
        Ok(Some(*command))
    }
}

fn handler_for(command: Command) -> Handler {
    match command {
        Command::Update => handle_update,
        Command::List => handle_list,
        Command::Deactivate => handle_deactivate,
        Command::Keep => handle_keep,
        Command::Activate => handle_activate,
        Command::InternetConnected => handle_connected,
        Command::Paired => handle_paired,
        Command::ConverseRequest => handle_converse,
    }
}

/// Consume bus messages until cancelled.
pub async fn run_dispatcher(
    table: CommandTable,
    ctx: CommandContext,
    mut rx: broadcast::Receiver<Message>,
    cancel: CancellationToken,
) {
    info!(commands = table.handlers.len(), "command dispatcher started");
    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "command dispatcher lagged, messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let Err(e) = table.dispatch(&ctx, &msg) {
            warn!(error = %e, "command rejected");
        }
    }
    info!("command dispatcher stopped");
}

fn parse<T: for<'de> serde::Deserialize<'de>>(command: Command, msg: &Message) -> Result<T> {
    msg.payload().map_err(|source| CommandError::InvalidPayload {
        command: command.as_str(),
        source,
    })
}

fn trigger(ctx: &CommandContext, reason: TriggerReason) {
    let outcome = ctx.scheduler.trigger(reason);
    info!(reason = reason.as_str(), outcome = outcome.as_str(), "pass requested");
}

fn handle_update(ctx: &CommandContext, _msg: &Message) -> Result<()> {
    trigger(ctx, TriggerReason::UpdateCommand);
    Ok(())
}

fn handle_connected(ctx: &CommandContext, _msg: &Message) -> Result<()> {
    trigger(ctx, TriggerReason::Connected);
    Ok(())
}

fn handle_paired(ctx: &CommandContext, _msg: &Message) -> Result<()> {
    trigger(ctx, TriggerReason::Paired);
    Ok(())
}

fn handle_list(ctx: &CommandContext, _msg: &Message) -> Result<()> {
    ctx.bus
        .emit_status(StatusEvent::SkillsList, &build_skill_list(&ctx.scheduler, &ctx.loader));
    Ok(())
}

fn handle_deactivate(ctx: &CommandContext, msg: &Message) -> Result<()> {
    let target: SkillTarget = parse(Command::Deactivate, msg)?;
    ctx.loader.deactivate(&target.skill);
    Ok(())
}

fn handle_activate(ctx: &CommandContext, msg: &Message) -> Result<()> {
    let target: SkillTarget = parse(Command::Activate, msg)?;
    let skills = ctx.loader.skills();

    let changed = if target.skill == ACTIVATE_ALL {
        let ids = skills.activate_all();
        info!(count = ids.len(), "all skills activated");
        !ids.is_empty()
    } else if skills.activate(&target.skill) {
        info!(skill = %target.skill, "skill activated");
        true
    } else {
        debug!(skill = %target.skill, "skill was not deactivated");
        false
    };

    // Reactivated skills load in the pass this queues.
    if changed {
        trigger(ctx, TriggerReason::Activated);
    }
    Ok(())
}

fn handle_keep(ctx: &CommandContext, msg: &Message) -> Result<()> {
    let target: SkillTarget = parse(Command::Keep, msg)?;
    if ctx.loader.skills().pin(&target.skill) {
        info!(skill = %target.skill, "skill pinned");
    }
    Ok(())
}

fn handle_converse(ctx: &CommandContext, msg: &Message) -> Result<()> {
    let request: ConverseRequest = parse(Command::ConverseRequest, msg)?;

    let error = match ctx.loader.skills().converse_status(&request.skill_id) {
        ConverseStatus::Ready => {
            ctx.bus.emit(msg.forward(converse_target(&request.skill_id)));
            return Ok(());
        }
        ConverseStatus::Unknown => "skill id does not exist",
        ConverseStatus::NotLoaded => "converse requested but skill not loaded",
    };

    debug!(skill = %request.skill_id, error, "converse request rejected");
    ctx.bus.emit(msg.reply(
        StatusEvent::ConverseError.as_str(),
        serde_json::to_value(ConverseErrorPayload {
            skill_id: request.skill_id,
            error: error.to_string(),
        })
        .unwrap_or_else(|_| json!({})),
    ));
    Ok(())
}

/// Current view of every known skill for `mycroft.skills.list`.
pub fn build_skill_list(scheduler: &Scheduler, loader: &DirectoryLoader) -> SkillListPayload {
    let installed = scheduler.installed();
    let mut skills: BTreeMap<String, SkillListEntry> = loader
        .skills()
        .snapshot()
        .into_iter()
        .map(|state| {
            let entry = SkillListEntry {
                installed: installed.contains(&state.id),
                id: state.id.clone(),
                active: state.active,
                loaded: state.loaded,
                pinned: state.pinned,
            };
            (state.id, entry)
        })
        .collect();

    for id in &installed {
        skills
            .entry(id.clone())
            .or_insert_with(|| SkillListEntry {
                id: id.clone(),
                active: true,
                loaded: false,
                installed: true,
                pinned: false,
            });
    }

    SkillListPayload {
        skills,
        installed,
        catalog: scheduler
            .catalog()
            .into_iter()
            .map(|record| record.id)
            .collect(),
        scheduler: scheduler.snapshot(),
    }
}
