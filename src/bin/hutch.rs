//! hutch – builds an in-process broker from configuration and either
//! checks the topology or drops into an interactive shell against it.
//
//  $ hutch check --config hutch.toml
//  $ hutch shell
//  > queue jobs
//  > pub - jobs hello
//  > get jobs
//  [1] jobs <- '' : hello
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

use hutch::{
    BasicProperties, Broker, Channel, Config, ConnectionParameters, ConsumeOptions, Connection,
    Delivery, DeliveryTag, ExchangeDeclareOptions, ExchangeKind, QueueDeclareOptions,
    QueueDeleteOptions,
};

#[derive(Debug, Parser)]
#[command(name = "hutch", version, about = "In-process AMQP-style broker shell")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open an interactive shell on a fresh broker.
    Shell {
        /// Path to config TOML (env HUTCH_CONFIG is used when absent)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Load the configuration, declare its topology and print a summary.
    Check {
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hutch::logging::init_logging()?;
    let cli = Cli::parse();

    match cli.cmd {
        Command::Check { config } => check(config.as_deref()),
        Command::Shell { config } => shell(config.as_deref()).await,
    }
}

fn build(path: Option<&str>) -> anyhow::Result<std::sync::Arc<Broker>> {
    let cfg = Config::load(path)?;
    Ok(Broker::from_config(&cfg)?)
}

fn check(path: Option<&str>) -> anyhow::Result<()> {
    let broker = build(path)?;
    println!("✅ configuration OK");
    println!("{:#?}", broker.config());
    print_topology(&broker);
    Ok(())
}

fn print_topology(broker: &Broker) {
    println!("exchanges:");
    for name in broker.exchange_names() {
        if let Some(ex) = broker.exchange(&name) {
            let shown = if name.is_empty() { "(default)" } else { name.as_str() };
            println!("  {shown} [{}]", ex.kind);
        }
    }
    println!("queues:");
    for name in broker.queue_names() {
        println!("  {name} ({} ready)", broker.queue_depth(&name).unwrap_or(0));
    }
    println!("bindings:");
    for (exchange, key, queue) in broker.bindings() {
        println!("  {exchange} --[{key}]--> {queue}");
    }
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
const HELP: &str = "\
exchange <name> <direct|fanout|topic|headers> | exchange-delete <name>
queue [name] | queue-delete <name> | purge <queue>
bind <queue> <exchange> [key] | unbind <queue> <exchange> [key]
pub <exchange|-> <key> <msg...> | get <queue> [noack]
consume <queue> [auto] | cancel <tag> | qos <n> | wait <secs>
ack <tag> [multiple] | nack <tag> [requeue] | reject <tag> [requeue]
topology | stats | exit";

async fn shell(path: Option<&str>) -> anyhow::Result<()> {
    let broker = build(path)?;
    let conn = Connection::open(broker, ConnectionParameters::default().with_name("hutch-shell"));
    let ch = conn.channel()?;
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;

    println!("📡 hutch shell on channel {}. Type `help` for commands.", ch.number());

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());
        let words: Vec<&str> = line.split_whitespace().collect();

        match words.as_slice() {
            [] => continue,
            ["help"] => println!("{HELP}"),
            ["exit" | "quit"] => break,
            ["wait", secs] => {
                let secs: u64 = match secs.parse() {
                    Ok(secs) => secs,
                    Err(e) => {
                        println!("❌ {e}");
                        continue;
                    }
                };
                match tokio::time::timeout(Duration::from_secs(secs), ch.start_consuming()).await {
                    Ok(Ok(())) => println!("no consumers left"),
                    Ok(Err(e)) => println!("❌ {e}"),
                    Err(_) => {}
                }
            }
            words => {
                if let Err(e) = run(&conn, &ch, words) {
                    println!("❌ {e}");
                }
            }
        }

        if let Err(e) = ch.pump() {
            println!("❌ {e}");
            break;
        }
    }

    conn.close();
    Ok(())
}

fn parse_tag(raw: &str) -> anyhow::Result<DeliveryTag> {
    Ok(DeliveryTag::from_raw(raw.parse()?))
}

fn exchange_arg(raw: &str) -> &str {
    if raw == "-" {
        ""
    } else {
        raw
    }
}

fn print_delivery(delivery: &Delivery) {
    let source = delivery.consumer_tag.as_deref().unwrap_or("get");
    println!(
        "[{}] {} <- '{}' {}{}: {}",
        delivery.delivery_tag,
        source,
        delivery.exchange,
        delivery.routing_key,
        if delivery.redelivered { " (redelivered)" } else { "" },
        String::from_utf8_lossy(&delivery.body)
    );
}

fn run(conn: &Connection, ch: &Channel, words: &[&str]) -> anyhow::Result<()> {
    match words {
        ["exchange", name, kind] => {
            let kind: ExchangeKind = kind.parse()?;
            ch.declare_exchange(name, kind, ExchangeDeclareOptions::default())?;
            println!("OK exchange {name} [{kind}]");
        }
        ["exchange-delete", name] => {
            ch.delete_exchange(name, false)?;
            println!("OK deleted exchange {name}");
        }
        ["queue"] | ["queue", _] => {
            let name = words.get(1).copied().unwrap_or("");
            let ok = ch.declare_queue(name, QueueDeclareOptions::default())?;
            println!(
                "OK queue {} ({} ready, {} consumers)",
                ok.queue, ok.message_count, ok.consumer_count
            );
        }
        ["queue-delete", name] => {
            let dropped = ch.delete_queue(name, QueueDeleteOptions::default())?;
            println!("OK deleted queue {name}, {dropped} messages dropped");
        }
        ["purge", name] => println!("OK purged {} messages", ch.purge(name)?),
        ["bind", queue, exchange, rest @ ..] => {
            let key = rest.first().copied().unwrap_or("");
            ch.bind(queue, exchange_arg(exchange), key)?;
            println!("OK bound {queue} to {exchange} [{key}]");
        }
        ["unbind", queue, exchange, rest @ ..] => {
            let key = rest.first().copied().unwrap_or("");
            ch.unbind(queue, exchange_arg(exchange), key)?;
            println!("OK unbound {queue} from {exchange} [{key}]");
        }
        ["pub", exchange, key, body @ ..] => {
            let routed = ch.publish(
                exchange_arg(exchange),
                key,
                body.join(" "),
                BasicProperties::default(),
                false,
            )?;
            println!("OK routed to {routed} queue(s)");
        }
        ["get", queue, rest @ ..] => {
            let auto_ack = rest.first() == Some(&"noack");
            match ch.get(queue, auto_ack)? {
                Some(delivery) => print_delivery(&delivery),
                None => println!("(empty)"),
            }
        }
        ["consume", queue, rest @ ..] => {
            let options = if rest.first() == Some(&"auto") {
                ConsumeOptions::auto_ack()
            } else {
                ConsumeOptions::default()
            };
            let tag = ch.consume(queue, options, |_, delivery| print_delivery(&delivery))?;
            println!("OK consumer {tag}");
        }
        ["cancel", tag] => {
            if !ch.cancel(tag)? {
                bail!("no consumer '{tag}' on this channel");
            }
            println!("OK cancelled {tag}");
        }
        ["ack", tag, rest @ ..] => ch.ack(parse_tag(tag)?, rest.first() == Some(&"multiple"))?,
        ["nack", tag, rest @ ..] => {
            ch.nack(parse_tag(tag)?, false, rest.first() == Some(&"requeue"))?
        }
        ["reject", tag, rest @ ..] => ch.reject(parse_tag(tag)?, rest.first() == Some(&"requeue"))?,
        ["qos", count] => {
            ch.set_qos(count.parse()?)?;
            println!("OK prefetch {}", ch.prefetch_count());
        }
        ["topology"] => print_topology(conn.broker()),
        ["stats"] => {
            println!("{:#?}", conn.broker().stats());
            println!("unacked on this channel: {:?}", ch.unacked_tags());
        }
        _ => return Err(anyhow!("unknown command, type `help`")),
    }
    Ok(())
}
