//! Diceroll Party CLI
//!
//! Simulates a room of peers on an in-process relay:
//! - Group key agreement and phrase verification
//! - Chat and nickname traffic over the sealed channel
//! - Commit-reveal dice rolls

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use diceroll_core::roll::RollResult;
use diceroll_core::transport::MemoryRelay;
use diceroll_core::{DiceSet, Room, RoomConfig, RoomEvent, RoomHandle, SessionState};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn, Level};

/// Diceroll Party - simulated dice table
#[derive(Parser)]
#[command(name = "diceroll-party")]
#[command(about = "Fair dice rolls among mutually distrusting peers")]
#[command(version)]
struct Cli {
    /// Room name
    #[arg(short, long, env = "DICEROLL_ROOM", default_value = "lobby")]
    room: String,

    /// Number of simulated peers
    #[arg(short, long, env = "DICEROLL_PEERS", default_value_t = 3)]
    peers: usize,

    /// Nickname prefix; peers are named <prefix><index>
    #[arg(long, env = "DICEROLL_NICK_PREFIX", default_value = "player")]
    nick_prefix: String,

    /// Seconds to wait for any single protocol step
    #[arg(long, env = "DICEROLL_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Print results as JSON lines
    #[arg(long, env = "DICEROLL_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Form the group and print the confirmation phrase
    Phrase,

    /// Form the group and roll dice
    Roll {
        /// Rounds of rolling; each round a different peer rolls every die
        #[arg(short = 'n', long, env = "DICEROLL_ROUNDS", default_value_t = 1)]
        rounds: usize,

        /// Dice set, e.g. d6,d6,d20
        #[arg(short, long, env = "DICEROLL_DICE", default_value = "d6,d6")]
        dice: DiceSet,
    },
}

struct Participant {
    nick: String,
    handle: RoomHandle,
    events: UnboundedReceiver<RoomEvent>,
    phrase: Option<String>,
    results: Vec<RollResult>,
}

#[derive(Serialize)]
struct RoundReport<'a> {
    round: usize,
    roller: &'a str,
    phrase: &'a str,
    results: &'a [RollResult],
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.peers == 0 {
        bail!("need at least one peer");
    }

    match cli.command {
        Commands::Phrase => {
            let table = form_group(&cli, DiceSet::default()).await?;
            show_group(&cli, &table)?;
        }
        Commands::Roll { rounds, ref dice } => {
            let mut table = form_group(&cli, dice.clone()).await?;
            show_group(&cli, &table)?;
            run_rounds(&cli, &mut table, rounds, dice.len()).await?;
        }
    }

    Ok(())
}

/// Join peers one at a time, waiting for the group to settle after each
async fn form_group(cli: &Cli, dice: DiceSet) -> Result<Vec<Participant>> {
    let relay = MemoryRelay::new();
    let mut table: Vec<Participant> = Vec::with_capacity(cli.peers);

    for i in 0..cli.peers {
        let nick = format!("{}{}", cli.nick_prefix, i);
        let mut config = RoomConfig::new(cli.room.clone());
        config.nick = Some(nick.clone());
        config.dice = dice.clone();

        let (transport, inbound) = relay.connect();
        let (handle, events) = Room::spawn(config, transport, inbound)?;
        info!(peer = %handle.local_id(), nick = %nick, "peer joining");

        table.push(Participant {
            nick,
            handle,
            events,
            phrase: None,
            results: Vec::new(),
        });
        for p in table.iter_mut() {
            wait_secured(cli, p).await?;
        }
    }

    Ok(table)
}

fn show_group(cli: &Cli, table: &[Participant]) -> Result<()> {
    let phrase = table[0]
        .phrase
        .clone()
        .ok_or_else(|| anyhow!("group has no phrase"))?;
    if let Some(p) = table.iter().find(|p| p.phrase.as_deref() != Some(phrase.as_str())) {
        bail!("{} sees a different phrase: {:?}", p.nick, p.phrase);
    }

    if cli.json {
        println!("{}", serde_json::json!({ "room": cli.room, "peers": table.len(), "phrase": phrase }));
    } else {
        println!("Room: {} ({} peers)", cli.room, table.len());
        for p in table.iter() {
            println!("  {} [{}]", p.nick, p.handle.local_id());
        }
        println!("Phrase: {}", phrase);
    }
    Ok(())
}

async fn run_rounds(cli: &Cli, table: &mut [Participant], rounds: usize, dice: usize) -> Result<()> {
    table[0].handle.chat(format!("rolling {} rounds", rounds))?;

    for round in 0..rounds {
        let who = round % table.len();
        info!(round, roller = %table[who].nick, "starting round");
        table[who].handle.roll_all()?;

        for p in table.iter_mut() {
            p.results.clear();
            while p.results.len() < dice {
                if let RoomEvent::RollResult(result) = next_event(cli, p).await? {
                    p.results.push(result);
                }
            }
            p.results.sort_by(|a, b| a.which.cmp(&b.which));
        }

        let expected = table[0].results.clone();
        if let Some(p) = table.iter().find(|p| p.results != expected) {
            bail!("{} disagrees on round {}", p.nick, round);
        }

        let roller = table[who].nick.as_str();
        let phrase = table[0].phrase.as_deref().unwrap_or_default();
        if cli.json {
            let report = RoundReport {
                round,
                roller,
                phrase,
                results: &expected,
            };
            println!("{}", serde_json::to_string(&report)?);
        } else {
            let faces: Vec<String> = expected
                .iter()
                .map(|r| format!("{}={}", r.die.name, r.face + 1))
                .collect();
            println!("Round {} ({}): {}", round + 1, roller, faces.join(" "));
        }
    }

    for p in table.iter() {
        p.handle.shutdown()?;
    }
    Ok(())
}

async fn wait_secured(cli: &Cli, p: &mut Participant) -> Result<()> {
    loop {
        match next_event(cli, p).await? {
            RoomEvent::StateChanged(SessionState::Secured) => return Ok(()),
            RoomEvent::VerifyFailed { peer, phrase } => {
                bail!("{}: peer {} reported phrase {:?}, group may be compromised", p.nick, peer, phrase)
            }
            _ => {}
        }
    }
}

/// Next event for `p`, bookkeeping phrases and logging noise on the way
async fn next_event(cli: &Cli, p: &mut Participant) -> Result<RoomEvent> {
    let event = tokio::time::timeout(Duration::from_secs(cli.timeout), p.events.recv())
        .await
        .map_err(|_| anyhow!("{} timed out waiting for the group", p.nick))?
        .ok_or_else(|| anyhow!("{} room stopped", p.nick))?;

    match &event {
        RoomEvent::Members { phrase, .. } => p.phrase = Some(phrase.clone()),
        RoomEvent::Chat { peer, text } => info!(to = %p.nick, from = %peer, %text, "chat"),
        RoomEvent::Nick { peer, nick } => debug!(to = %p.nick, peer = %peer, %nick, "nick"),
        RoomEvent::Fault(e) => warn!(peer = %p.nick, error = %e, "fault"),
        RoomEvent::DecryptionFailure { peer } => warn!(to = %p.nick, from = %peer, "undecryptable message"),
        RoomEvent::SignatureFailure { peer, .. } => warn!(to = %p.nick, from = %peer, "bad signature"),
        _ => {}
    }
    Ok(event)
}
