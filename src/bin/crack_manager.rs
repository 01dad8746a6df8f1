use clap::{Parser, Subcommand};
use crackhash::amqp::AmqpEmitterConnector;
use crackhash::config::ManagerConfig;
use crackhash::coordinator::{CoordinatorHandle, TaskCoordinator};
use crackhash::error::CrackError;
use crackhash::postgres_store::PostgresTaskStore;
use crossbeam_channel::unbounded;
use dotenv::dotenv;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::thread;
use tracing::info;

/// Commands accepted on stdin, one per line.
#[derive(Parser)]
#[command(name = "crack>", no_binary_name = true)]
struct Console {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand)]
enum ConsoleCommand {
    /// Start recovering a digest, or return the task already doing so
    Create {
        hash: String,
        max_length: u32,
    },
    /// Show a task's status and recovered word
    Status {
        request_id: String,
    },
    /// Report a found word by hand
    Report {
        request_id: String,
        word: String,
    },
    /// Stop the manager
    Quit,
}

fn execute(handle: &CoordinatorHandle, command: ConsoleCommand) -> Result<Option<serde_json::Value>, CrackError> {
    let response = match command {
        ConsoleCommand::Create { hash, max_length } => {
            let created = handle.create_task(&hash, max_length)?;
            json!({
                "requestId": created.task.request_id,
                "outcome": created.outcome,
                "status": created.task.status,
            })
        }
        ConsoleCommand::Status { request_id } => match handle.task_status(&request_id)? {
            Some(view) => serde_json::to_value(view)?,
            None => json!({ "error": format!("no task {}", request_id) }),
        },
        ConsoleCommand::Report { request_id, word } => {
            json!({ "accepted": handle.report_result(&request_id, &word)? })
        }
        ConsoleCommand::Quit => return Ok(None),
    };
    Ok(Some(response))
}

fn main() -> Result<(), CrackError> {
    dotenv().ok();
    crackhash::init_tracing("crack-manager");
    let config = ManagerConfig::from_env()?;
    let store = PostgresTaskStore::connect(&config.database_url)?;

    let (events, inbox) = unbounded();
    let connector = AmqpEmitterConnector::new(config.broker.clone(), events.clone());
    let coordinator = TaskCoordinator::new(store, connector, (&config).into());
    let runner = thread::Builder::new()
        .name("task-coordinator".to_string())
        .spawn(move || coordinator.run(inbox))?;
    let handle = CoordinatorHandle::new(events);
    info!("manager started");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let command = match Console::try_parse_from(line.split_whitespace()) {
            Ok(console) => console.command,
            Err(e) => {
                writeln!(stdout, "{}", e.render())?;
                continue;
            }
        };
        match execute(&handle, command) {
            Ok(Some(response)) => writeln!(stdout, "{}", response)?,
            Ok(None) => break,
            Err(e) => writeln!(stdout, "{}", json!({ "error": e.to_string() }))?,
        }
    }

    handle.shutdown();
    let _ = runner.join();
    Ok(())
}
