use std::io::{self, BufRead, Write};

use kadnode::{Dht, NodeStatus, ValuePayload, TEXT_PLAIN};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 4222)]
    port: u16,
    /// Bootstrap node, as `host:port`
    #[arg(short, long)]
    bootstrap: Option<String>,
    /// Don't sign values put by this node
    #[arg(long)]
    no_signing: bool,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let dht = Dht::run(cli.port, None, !cli.no_signing).expect("could not start node");

    dht.on_status_changed(|ipv4, ipv6| {
        println!("status: IPv4 {} IPv6 {}", label(ipv4), label(ipv6));
    })
    .expect("node was shutdown");

    if let Some(bootstrap) = cli.bootstrap {
        match bootstrap
            .rsplit_once(':')
            .map(|(host, port)| (host.trim_matches(['[', ']']), port.parse::<u16>()))
        {
            Some((host, Ok(port))) => match dht.bootstrap(host, port) {
                Ok(()) => println!("bootstrapped: {}", dht.bootstrapped().unwrap_or(false)),
                Err(error) => println!("error: {error}"),
            },
            _ => println!("error: bootstrap should be host:port"),
        }
    }

    println!("node {} listening on {}", dht.id(), dht.local_addr());
    help();

    let stdin = io::stdin();
    prompt();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };

        if line.trim().is_empty() {
            break;
        }

        let args = match split_args(&line) {
            Ok(args) => args,
            Err(error) => {
                println!("error: {error}");
                prompt();
                continue;
            }
        };
        let args = args.iter().map(String::as_str).collect::<Vec<_>>();

        match args.as_slice() {
            ["get", key] => get(&dht, key),
            ["put", key, value @ ..] if !value.is_empty() => put(&dht, key, &value.join(" ")),
            ["addr"] => match dht.info() {
                Ok(info) => println!(
                    "{} ({} nodes, {} values)",
                    info.local_addr(),
                    info.routing_table_size(),
                    info.stored_values()
                ),
                Err(error) => println!("error: {error}"),
            },
            ["quit"] => break,
            _ => help(),
        }

        prompt();
    }

    dht.shutdown();
}

fn get(dht: &Dht, key: &str) {
    match dht.get(key, None) {
        Ok(mut stream) => {
            for value in stream.by_ref() {
                match value.payload() {
                    ValuePayload::Text(text) => println!("{key}: {text}"),
                    ValuePayload::Unknown { user_type, data } => {
                        println!("{key}: <{user_type}, {} bytes>", data.len())
                    }
                }
            }

            match stream.finish() {
                Ok(true) => {}
                Ok(false) => println!("{key}: not found"),
                Err(error) => println!("error: {error}"),
            }
        }
        Err(error) => println!("error: {error}"),
    }
}

fn put(dht: &Dht, key: &str, value: &str) {
    match dht.put(key, value.as_bytes().to_vec(), TEXT_PLAIN) {
        Ok(_) => println!("{key}: stored"),
        Err(error) => println!("error: {error}"),
    }
}

fn label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Disconnected => "disconnected",
        NodeStatus::Connecting => "connecting",
        NodeStatus::Connected => "connected",
    }
}

fn help() {
    println!("commands:");
    println!("  get <key>          look up the values stored under <key>");
    println!("  put <key> <value>  store a text value under <key>");
    println!("  addr               show the local address");
    println!("  help               show this message");
    println!("quote arguments with spaces, as in: put \"my key\" \"some value\"");
    println!("press ENTER on an empty line to exit");
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Split a line on whitespace, keeping double quoted arguments whole.
fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = vec![];
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let Some(first) = chars.next() else {
            return Ok(args);
        };

        let mut arg = String::new();

        if first == '"' {
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => arg.push(c),
                        None => return Err("unterminated escape".to_string()),
                    },
                    Some(c) => arg.push(c),
                    None => return Err("missing closing quote".to_string()),
                }
            }
        } else {
            arg.push(first);

            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                arg.push(c);
            }
        }

        args.push(arg);
    }
}
