//! Line-oriented driver used by the `taskpulse` binary.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
    time,
};

use crate::{
    db::Database,
    events::EngineEvent,
    models::{Priority, Task},
    notifications::LocalDelivery,
    priority::{score, PriorityConfig},
    settings::SettingsStore,
    Engine,
};

const DELIVERY_PUMP_INTERVAL: Duration = Duration::from_millis(500);

const HELP: &str = "\
commands:
  add <priority> <minutes> <text...>   create a task
  start <id> [minutes]                 start its countdown
  pause | resume                       pause or resume the running timer
  complete <id> | reschedule <id> | delete <id>
  remaining <id>                       seconds left on its timer
  fg | bg | tap <id>                   lifecycle signals
  list | next | xp | help | quit";

pub(crate) async fn run(data_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let database = Database::new(data_dir.join("taskpulse.sqlite3"))?;
    let settings = SettingsStore::new(data_dir.join("settings.json"))?.engine();
    let delivery = Arc::new(LocalDelivery::new());
    let engine = Engine::new(database, delivery.clone(), settings);

    spawn_event_printer(&engine);
    spawn_delivery_pump(delivery);

    if let Some(event) = engine.on_cold_start().await {
        println!("completed while away: {}", event.task_id);
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        if let Err(err) = execute(&engine, line).await {
            println!("error: {err:#}");
        }
    }

    info!("taskpulse shutting down");
    Ok(())
}

async fn execute(engine: &Engine, line: &str) -> Result<()> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    match command {
        "add" => {
            let [priority, minutes, text @ ..] = args.as_slice() else {
                bail!("usage: add <priority> <minutes> <text...>");
            };
            let priority =
                Priority::parse(priority).ok_or_else(|| anyhow!("unknown priority {priority}"))?;
            let minutes: u32 = minutes.parse().context("minutes must be a whole number")?;
            let task = Task::new(
                engine.settings().user_id.clone(),
                text.join(" "),
                priority,
                minutes,
            );
            let task = engine.create_task(task).await?;
            println!("added {}", task.id);
        }
        "start" => {
            let id = task_arg(&args)?;
            let minutes = args
                .get(1)
                .map(|m| m.parse::<f64>())
                .transpose()
                .context("minutes must be a number")?;
            let snapshot = engine.start_timer_for_task(id, minutes).await?;
            println!("running: {}s left", snapshot.remaining_secs);
        }
        "pause" => {
            let snapshot = engine.pause_timer().await?;
            println!("{:?}: {}s left", snapshot.slot.status, snapshot.remaining_secs);
        }
        "resume" => {
            let snapshot = engine.resume_timer().await?;
            println!("{:?}: {}s left", snapshot.slot.status, snapshot.remaining_secs);
        }
        "complete" => {
            let id = task_arg(&args)?;
            match engine.complete_task(id).await? {
                Some(next) => println!(
                    "completed {id}; now timing {}",
                    next.slot.task_id.unwrap_or_default()
                ),
                None => println!("completed {id}"),
            }
        }
        "reschedule" => {
            let id = task_arg(&args)?;
            let snapshot = engine.reschedule_task(id).await?;
            println!("rescheduled {id}: {}s left", snapshot.remaining_secs);
        }
        "delete" => {
            let id = task_arg(&args)?;
            let removed = engine.delete_task(id).await?;
            println!("{}", if removed { "deleted" } else { "no such task" });
        }
        "remaining" => {
            let id = task_arg(&args)?;
            println!("{}s", engine.get_remaining_seconds(id).await?);
        }
        "fg" => match engine.on_foreground().await {
            Some(event) => println!("time's up: {}", event.task_id),
            None => println!("nothing to show"),
        },
        "bg" => {
            engine.on_background();
            println!("backgrounded");
        }
        "tap" => {
            let id = task_arg(&args)?;
            match engine.on_notification_response(id).await {
                Some(event) => println!("time's up: {}", event.task_id),
                None => println!("nothing to show"),
            }
        }
        "list" => {
            let now = Utc::now();
            let running = engine.timer_snapshot().await.slot.task_id;
            let config = PriorityConfig::default();
            for task in engine.list_open().await? {
                println!(
                    "{:>7.1}  {:<6}  {:<36}  {}",
                    score(&task, now, running.as_deref(), &config),
                    task.priority.as_str(),
                    task.id,
                    task.text
                );
            }
        }
        "next" => match engine.select_next().await? {
            Some(task) => println!("{} ({})", task.id, task.text),
            None => println!("nothing open"),
        },
        "xp" => println!("{} xp", engine.total_xp().await?),
        "help" => println!("{HELP}"),
        other => bail!("unknown command {other:?}; try help"),
    }
    Ok(())
}

fn task_arg<'a>(args: &[&'a str]) -> Result<&'a str> {
    args.first().copied().ok_or_else(|| anyhow!("missing task id"))
}

fn spawn_event_printer(engine: &Engine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::TimerHeartbeat(_)) => {}
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => println!("event {json}"),
                    Err(err) => warn!("Unprintable event: {err}"),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event printer skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Stands in for the OS: fires due reminders and prints them.
fn spawn_delivery_pump(delivery: Arc<LocalDelivery>) {
    tokio::spawn(async move {
        let mut interval = time::interval(DELIVERY_PUMP_INTERVAL);
        loop {
            interval.tick().await;
            for fired in delivery.fire_due(Utc::now()) {
                println!("notification {} for task {}", fired.identifier, fired.task_id);
            }
        }
    });
}
