use std::{env, path::PathBuf, process, sync::Arc};

use chrono::NaiveDate;
use core_types::{
    BeaconId, EntityId, GatewayAddress, GatewayId,
    config::{AppConfig, ConfigError},
};
use directory::{DirectoryError, SqliteDirectory};
use presence_engine::{PresenceQuery, QueryError};
use presence_store::{HistoryLedger, LedgerError, PresenceStore, StoreError};
use serde_json::Value;
use thiserror::Error;

const USAGE: &str = "usage: presence-admin [--config=PATH] <command>
commands:
  people
  gateways
  add-person <name> <sector> <beacon>
  update-person <id> <name> <sector> <beacon>
  remove-person <id>
  add-gateway <name> <sector> <address>
  rename-gateway <id> <name> <sector>
  history <entity-id> <from YYYY-MM-DD> <to YYYY-MM-DD>";

fn main() {
    if let Err(err) = run() {
        eprintln!("presence-admin failed: {err}");
        process::exit(1);
    }
}

#[derive(Debug, Error)]
enum AdminError {
    #[error("{USAGE}")]
    Usage,
    #[error("invalid {field} '{value}'")]
    InvalidArg { field: &'static str, value: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

enum Command {
    People,
    Gateways,
    AddPerson {
        name: String,
        sector: String,
        beacon: BeaconId,
    },
    UpdatePerson {
        id: EntityId,
        name: String,
        sector: String,
        beacon: BeaconId,
    },
    RemovePerson {
        id: EntityId,
    },
    AddGateway {
        name: String,
        sector: String,
        address: GatewayAddress,
    },
    RenameGateway {
        id: GatewayId,
        name: String,
        sector: String,
    },
    History {
        entity_id: EntityId,
        from: NaiveDate,
        to: NaiveDate,
    },
}

struct CliArgs {
    config: Option<PathBuf>,
    command: Command,
}

impl CliArgs {
    fn parse() -> Result<Self, AdminError> {
        let mut config = None;
        let mut positional = Vec::new();
        for arg in env::args().skip(1) {
            if let Some(value) = arg.strip_prefix("--config=") {
                config = Some(PathBuf::from(value));
            } else {
                positional.push(arg);
            }
        }
        let command = match positional
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .as_slice()
        {
            ["people"] => Command::People,
            ["gateways"] => Command::Gateways,
            ["add-person", name, sector, beacon] => Command::AddPerson {
                name: name.to_string(),
                sector: sector.to_string(),
                beacon: BeaconId::new(beacon),
            },
            ["update-person", id, name, sector, beacon] => Command::UpdatePerson {
                id: parse_id("person id", id)?,
                name: name.to_string(),
                sector: sector.to_string(),
                beacon: BeaconId::new(beacon),
            },
            ["remove-person", id] => Command::RemovePerson {
                id: parse_id("person id", id)?,
            },
            ["add-gateway", name, sector, address] => Command::AddGateway {
                name: name.to_string(),
                sector: sector.to_string(),
                address: GatewayAddress::new(address),
            },
            ["rename-gateway", id, name, sector] => Command::RenameGateway {
                id: parse_id("gateway id", id)?,
                name: name.to_string(),
                sector: sector.to_string(),
            },
            ["history", entity_id, from, to] => Command::History {
                entity_id: parse_id("entity id", entity_id)?,
                from: parse_date("from date", from)?,
                to: parse_date("to date", to)?,
            },
            _ => return Err(AdminError::Usage),
        };
        Ok(Self { config, command })
    }
}

fn parse_id(field: &'static str, raw: &str) -> Result<i64, AdminError> {
    raw.parse().map_err(|_| AdminError::InvalidArg {
        field,
        value: raw.to_string(),
    })
}

fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, AdminError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| AdminError::InvalidArg {
        field,
        value: raw.to_string(),
    })
}

fn run() -> Result<(), AdminError> {
    let args = CliArgs::parse()?;
    let config = AppConfig::load(args.config.as_deref())?;
    let directory = Arc::new(SqliteDirectory::open(&config.storage.database_path)?);

    let output = match args.command {
        Command::People => serde_json::to_value(directory.list_people()?)?,
        Command::Gateways => serde_json::to_value(directory.list_gateways()?)?,
        Command::AddPerson {
            name,
            sector,
            beacon,
        } => serde_json::to_value(directory.register_person(&name, &sector, &beacon)?)?,
        Command::UpdatePerson {
            id,
            name,
            sector,
            beacon,
        } => serde_json::to_value(directory.update_person(id, &name, &sector, &beacon)?)?,
        Command::RemovePerson { id } => {
            directory.delete_person(id)?;
            serde_json::json!({ "removed": id })
        }
        Command::AddGateway {
            name,
            sector,
            address,
        } => serde_json::to_value(directory.register_gateway(&name, &sector, &address)?)?,
        Command::RenameGateway { id, name, sector } => {
            serde_json::to_value(directory.rename_gateway(id, &name, &sector)?)?
        }
        Command::History {
            entity_id,
            from,
            to,
        } => {
            let ledger = HistoryLedger::open(&config.storage.database_path)?;
            let store = Arc::new(PresenceStore::new(ledger, config.presence.buffer_window())?);
            let query = PresenceQuery::new(store, directory);
            serde_json::to_value(query.history_for(entity_id, from, to)?)?
        }
    };
    print_json(&output)
}

fn print_json(value: &Value) -> Result<(), AdminError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
