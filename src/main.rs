mod app;
mod config;
mod error;
mod ethereum;

use alloy::primitives::U256;
use anyhow::{anyhow, Result};
use app::App;
use clap::{Arg, ArgMatches, Command};
use config::Config;
use ethereum::utils;
use serde_json::Value;
use std::path::Path;
use tracing::{error, info};

fn function_args() -> [Arg; 2] {
    [
        Arg::new("function")
            .value_name("FUNCTION")
            .required(true)
            .help("Contract function name"),
        Arg::new("args")
            .value_name("ARGS_JSON")
            .help("Arguments as a JSON array (positional) or object (by parameter name)"),
    ]
}

fn event_arg() -> Arg {
    Arg::new("event")
        .short('e')
        .long("event")
        .value_name("EVENT")
        .help("Only logs of this event, e.g. FilmAdded")
}

fn cli() -> Command {
    Command::new("film-client")
        .version("0.1.0")
        .about("Client for the film registry contract: add and delete films, decode their events")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("rpc-url")
                .short('r')
                .long("rpc-url")
                .value_name("URL")
                .global(true)
                .help("RPC endpoint URL"),
        )
        .arg(
            Arg::new("contract")
                .long("contract")
                .value_name("ADDRESS")
                .global(true)
                .help("Contract address"),
        )
        .arg(
            Arg::new("private-key-env")
                .long("private-key-env")
                .value_name("NAME")
                .default_value("PRIVATE_KEY")
                .global(true)
                .help("Environment variable holding the signing key"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a sample configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config-path")
                .long("config-path")
                .help("Print the default configuration file path and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("run")
                .about("Add the film \"lol\", delete it, then decode logs of the configured block range"),
        )
        .subcommand(
            Command::new("add-film")
                .about("Send addFilm(title, year, genre)")
                .arg(Arg::new("title").required(true))
                .arg(Arg::new("year").required(true))
                .arg(
                    Arg::new("genre")
                        .required(true)
                        .value_parser(clap::value_parser!(u8)),
                ),
        )
        .subcommand(
            Command::new("delete-film")
                .about("Send deleteFilm(title)")
                .arg(Arg::new("title").required(true)),
        )
        .subcommand(
            Command::new("send")
                .about("Send a transaction calling any contract function")
                .args(function_args())
                .arg(
                    Arg::new("value")
                        .long("value")
                        .value_name("WEI")
                        .help("Native currency to attach, decimal or 0x hex"),
                ),
        )
        .subcommand(
            Command::new("call")
                .about("Call a read-only contract function")
                .args(function_args()),
        )
        .subcommand(
            Command::new("token")
                .about("Show token name, symbol and total supply")
                .arg(
                    Arg::new("account")
                        .long("account")
                        .value_name("ADDRESS")
                        .help("Also show the balance of this account"),
                ),
        )
        .subcommand(
            Command::new("encode")
                .about("Print the calldata of a function call without connecting")
                .args(function_args()),
        )
        .subcommand(
            Command::new("logs")
                .about("Decode contract logs in a block range")
                .arg(Arg::new("from").long("from").value_name("BLOCK"))
                .arg(Arg::new("to").long("to").value_name("BLOCK"))
                .arg(event_arg()),
        )
        .subcommand(
            Command::new("watch")
                .about("Decode contract logs as they arrive until Ctrl-C")
                .arg(event_arg()),
        )
        .subcommand(
            Command::new("watch-films")
                .about("Print FilmAdded events as they arrive until Ctrl-C"),
        )
}

fn json_args(matches: &ArgMatches) -> Result<Value> {
    match matches.get_one::<String>("args") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow!("ARGS_JSON is not valid JSON: {}", e)),
        None => Ok(Value::Null),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

async fn load_config(matches: &ArgMatches) -> Result<Config> {
    let config_path = matches.get_one::<String>("config").map(Path::new);
    let mut config = Config::load(config_path).await?;

    if let Some(rpc_url) = matches.get_one::<String>("rpc-url") {
        config.network.rpc_url = rpc_url.clone();
    }
    if let Some(address) = matches.get_one::<String>("contract") {
        config.contract.address = address.clone();
    }
    Ok(config)
}

async fn execute(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches).await?;
    let key_env = matches
        .get_one::<String>("private-key-env")
        .map(String::as_str)
        .unwrap_or("PRIVATE_KEY");

    let (name, sub) = match matches.subcommand() {
        Some((name, sub)) => (name, sub),
        None => ("run", matches),
    };

    if name == "encode" {
        let chain_id = config.network.chain_id.unwrap_or(1);
        let descriptor = app::load_descriptor(&config, chain_id).await?;
        let function = sub
            .get_one::<String>("function")
            .ok_or_else(|| anyhow!("FUNCTION is required"))?;
        println!("{}", app::encode(&descriptor, function, &json_args(sub)?)?);
        return Ok(());
    }

    info!("Using network {}", config.network.name);
    let query = config.query.clone();
    let app = App::connect(config).await?;

    match name {
        "run" => {
            let signer = app::load_signer(key_env)?;
            app.run(&signer, |value| print_json(&value)).await?;
        }
        "add-film" => {
            let signer = app::load_signer(key_env)?;
            let title = sub
                .get_one::<String>("title")
                .ok_or_else(|| anyhow!("TITLE is required"))?;
            let year: U256 = sub
                .get_one::<String>("year")
                .ok_or_else(|| anyhow!("YEAR is required"))
                .and_then(|year| utils::parse_amount(year))?;
            let genre = *sub
                .get_one::<u8>("genre")
                .ok_or_else(|| anyhow!("GENRE is required"))?;
            print_json(&app.add_film(&signer, title, year, genre).await?);
        }
        "delete-film" => {
            let signer = app::load_signer(key_env)?;
            let title = sub
                .get_one::<String>("title")
                .ok_or_else(|| anyhow!("TITLE is required"))?;
            print_json(&app.delete_film(&signer, title).await?);
        }
        "send" => {
            let signer = app::load_signer(key_env)?;
            let function = sub
                .get_one::<String>("function")
                .ok_or_else(|| anyhow!("FUNCTION is required"))?;
            let value = sub
                .get_one::<String>("value")
                .map(|v| utils::parse_amount(v))
                .transpose()?;
            print_json(&app.send(&signer, function, &json_args(sub)?, value).await?);
        }
        "call" => {
            let function = sub
                .get_one::<String>("function")
                .ok_or_else(|| anyhow!("FUNCTION is required"))?;
            print_json(&app.call(function, &json_args(sub)?).await?);
        }
        "token" => {
            let account = sub
                .get_one::<String>("account")
                .map(|a| utils::validate_address(a))
                .transpose()?;
            print_json(&app.token_info(account).await?);
        }
        "logs" => {
            let from = match sub.get_one::<String>("from") {
                Some(block) => utils::parse_block_number(block)?,
                None => query.from_block,
            };
            let to = match sub.get_one::<String>("to") {
                Some(block) => utils::parse_block_number(block)?,
                None => query.to_block,
            };
            let event = sub.get_one::<String>("event").map(String::as_str);
            app.logs(from, to, event, |info| print_json(&info)).await?;
        }
        "watch" => {
            let event = sub.get_one::<String>("event").map(String::as_str);
            let count = app.watch(event, |info| print_json(&info)).await?;
            info!("Subscription closed after {} events", count);
        }
        "watch-films" => {
            let count = app.watch_films(|value| print_json(&value)).await?;
            info!("Subscription closed after {} films", count);
        }
        other => return Err(anyhow!("Unknown command: {}", other)),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output only
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if dotenv::dotenv().is_err() {
        info!("No .env file found");
    }

    let matches = cli().get_matches();

    if matches.get_flag("generate-config") {
        println!("{}", Config::generate_sample());
        return Ok(());
    }

    if matches.get_flag("config-path") {
        match Config::default_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return Ok(());
            }
            Err(e) => {
                error!("Could not determine default config path: {}", e);
                return Err(e);
            }
        }
    }

    if let Err(e) = execute(&matches).await {
        error!("{}", e);
        if let Some(hint) = app::error_hint(&e) {
            error!("{}", hint);
        }
        return Err(e);
    }

    Ok(())
}
