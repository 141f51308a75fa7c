use anyhow::{bail, Context, Result};
use carelink_core::{
    allowed_actions, Action, Appointment, AppointmentStatus, AppointmentUpdate, NewAppointment,
    RescheduleProposal, Role,
};
use carelink_sync::{AppointmentProjection, ClientConfig, CoordinationClient, StaticToken};
use chrono::{NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use std::{io, sync::Arc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_HUB_URL: &str = "http://127.0.0.1:4780";

#[derive(Parser)]
#[command(name = "carelink")]
#[command(about = "CareLink appointment sync client", long_about = None)]
struct Cli {
    #[arg(long, default_value = "", global = true)]
    hub_url: String,
    /// Session token; falls back to CARELINK_TOKEN.
    #[arg(long, default_value = "", global = true)]
    token: String,
    #[arg(long, default_value = "patient", global = true)]
    role: String,
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the channel open and print the list on every change
    Watch {
        /// Also report whether this user is online
        #[arg(long)]
        peer: Option<String>,
    },
    /// Fetch the list once
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Book a new appointment (patients only)
    Create {
        #[arg(long)]
        doctor: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        time: Option<NaiveTime>,
    },
    /// Apply a lifecycle action such as accept, cancel or complete
    Act {
        id: String,
        action: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Ask the doctor to move an appointment
    Reschedule {
        id: String,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        time: NaiveTime,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Change date, time or notes
    Update {
        id: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        time: Option<NaiveTime>,
        #[arg(long)]
        notes: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Show which actions a role may take, without contacting the hub
    Check {
        status: String,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        time: Option<NaiveTime>,
        #[arg(long, default_value_t = false)]
        reschedule_pending: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let role: Role = cli.role.parse().map_err(anyhow::Error::msg)?;

    if let Commands::Check {
        status,
        date,
        time,
        reschedule_pending,
    } = &cli.command
    {
        let status: AppointmentStatus = status.parse().map_err(anyhow::Error::msg)?;
        let actions = check_actions(role, status, *date, *time, *reschedule_pending);
        println!("{}", format_actions(&actions));
        return Ok(());
    }

    let hub_url = resolve_hub_url(&cli.hub_url);
    let hub_url = Url::parse(&hub_url).with_context(|| format!("invalid hub url {hub_url}"))?;
    let token = resolve_token(&cli.token);
    if token.is_none() {
        warn!("no_session: pass --token or set CARELINK_TOKEN");
    }
    let config = ClientConfig::new(hub_url, role)?;
    let tokens = token.map(StaticToken::new).unwrap_or_else(StaticToken::none);
    let client = CoordinationClient::new(config, Arc::new(tokens));

    match cli.command {
        Commands::Watch { peer } => watch(&client, peer).await?,
        Commands::List { json } => {
            client.refresh().await?;
            let projection = client.projection();
            if json {
                println!("{}", serde_json::to_string_pretty(&projection.appointments)?);
            } else {
                print_projection(&client, &projection);
            }
        }
        Commands::Create {
            doctor,
            reason,
            date,
            time,
        } => {
            let created = client
                .create(NewAppointment {
                    doctor_ref: doctor,
                    date,
                    time,
                    reason,
                })
                .await?;
            println!("created {} ({})", created.id, created.status);
        }
        Commands::Act { id, action, note } => {
            let action: Action = action.parse().map_err(anyhow::Error::msg)?;
            if action == Action::Reschedule || action == Action::Update {
                bail!("use the `{action}` subcommand for {action}");
            }
            let updated = client.change_status(&id, action, note).await?;
            println!("{} is now {}", updated.id, updated.status);
        }
        Commands::Reschedule {
            id,
            date,
            time,
            reason,
        } => {
            let updated = client
                .request_reschedule(&id, RescheduleProposal { date, time, reason })
                .await?;
            println!("{} reschedule requested ({})", updated.id, updated.status);
        }
        Commands::Update {
            id,
            date,
            time,
            notes,
        } => {
            let update = AppointmentUpdate { date, time, notes };
            if update.is_empty() {
                bail!("nothing to update: pass --date, --time or --notes");
            }
            let updated = client.update(&id, update).await?;
            println!("{} updated ({})", updated.id, updated.status);
        }
        Commands::Delete { id } => {
            client.delete(&id).await?;
            println!("{id} deleted");
        }
        Commands::Check { .. } => {}
    }

    client.shutdown();
    Ok(())
}

async fn watch(client: &CoordinationClient, peer: Option<String>) -> Result<()> {
    let channel = client.start().await?;
    info!("watch_started: channel {}", channel.id());
    let mut projection = client.watch_projection();
    let mut online = client.presence().subscribe();
    let mut last_revision = None;

    loop {
        let current = projection.borrow_and_update().clone();
        if last_revision != Some(current.revision) {
            last_revision = Some(current.revision);
            print_projection(client, &current);
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("watch_interrupted");
                break;
            }
            changed = projection.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(peer) = &peer {
                    let state = if client.presence().is_online(peer) { "online" } else { "offline" };
                    println!("{peer} is {state}");
                }
            }
        }
    }
    client.shutdown();
    Ok(())
}

fn print_projection(client: &CoordinationClient, projection: &AppointmentProjection) {
    println!(
        "revision {} ({} appointments)",
        projection.revision,
        projection.appointments.len()
    );
    if let Some(err) = &projection.last_error {
        println!("  last refresh failed: {err}");
    }
    for appointment in &projection.appointments {
        let when = match (appointment.date, appointment.time) {
            (Some(date), Some(time)) => format!("{date} {}", time.format("%H:%M")),
            _ => "tbd".to_string(),
        };
        let pending = if appointment.reschedule_requested {
            " reschedule pending"
        } else {
            ""
        };
        println!(
            "- [{}] {} {} with {}{} | can: {}",
            appointment.status,
            appointment.id,
            when,
            appointment.doctor_ref,
            pending,
            format_actions(&client.allowed_actions(appointment))
        );
    }
}

fn check_actions(
    role: Role,
    status: AppointmentStatus,
    date: Option<NaiveDate>,
    time: Option<NaiveTime>,
    reschedule_pending: bool,
) -> Vec<Action> {
    let now = Utc::now();
    let appointment = Appointment {
        id: "check".to_string(),
        patient_ref: String::new(),
        doctor_ref: String::new(),
        date,
        time,
        status,
        reason: String::new(),
        notes: String::new(),
        reschedule_requested: reschedule_pending,
        reschedule: None,
        patient_confirmed: false,
        created_at: now,
        updated_at: None,
    };
    allowed_actions(&appointment, role, now)
}

fn format_actions(actions: &[Action]) -> String {
    if actions.is_empty() {
        return "none".to_string();
    }
    actions
        .iter()
        .map(Action::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Log lines go to stderr so stdout stays parseable.
fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CARELINK_LOG_LEVEL") {
        level
    } else {
        "warn".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_hub_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    env_non_empty("CARELINK_HUB_URL").unwrap_or_else(|| DEFAULT_HUB_URL.to_string())
}

fn resolve_token(flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_non_empty("CARELINK_TOKEN").map(|token| token.trim().to_string())
}
