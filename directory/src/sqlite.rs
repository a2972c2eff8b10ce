use std::path::Path;
use std::time::Duration;

use core_types::{BeaconId, EntityId, GatewayAddress, GatewayId};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{Directory, DirectoryError, Gateway, Person};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    sector TEXT NOT NULL,
    beacon TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS gateways (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    sector TEXT NOT NULL,
    address TEXT NOT NULL UNIQUE
);
";

/// SQLite-backed directory. Identifiers are normalised by the `BeaconId` and
/// `GatewayAddress` constructors before they reach a query.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DirectoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DirectoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn register_person(
        &self,
        name: &str,
        sector: &str,
        beacon: &BeaconId,
    ) -> Result<Person, DirectoryError> {
        let name = required("name", name)?;
        if beacon.is_empty() {
            return Err(DirectoryError::InvalidInput { field: "beacon" });
        }
        let conn = self.conn.lock();
        if beacon_owner(&conn, beacon)?.is_some() {
            return Err(DirectoryError::DuplicateBeacon(beacon.clone()));
        }
        conn.execute(
            "INSERT INTO people (name, sector, beacon) VALUES (?1, ?2, ?3)",
            params![name, sector.trim(), beacon.as_str()],
        )?;
        let id = conn.last_insert_rowid();
        info!("[directory] registered person {id} with beacon {beacon}");
        Ok(Person {
            id,
            name: name.to_string(),
            sector: sector.trim().to_string(),
            beacon: beacon.clone(),
        })
    }

    pub fn update_person(
        &self,
        id: EntityId,
        name: &str,
        sector: &str,
        beacon: &BeaconId,
    ) -> Result<Person, DirectoryError> {
        let name = required("name", name)?;
        if beacon.is_empty() {
            return Err(DirectoryError::InvalidInput { field: "beacon" });
        }
        let conn = self.conn.lock();
        match beacon_owner(&conn, beacon)? {
            Some(owner) if owner != id => {
                return Err(DirectoryError::DuplicateBeacon(beacon.clone()));
            }
            _ => {}
        }
        let changed = conn.execute(
            "UPDATE people SET name = ?1, sector = ?2, beacon = ?3 WHERE id = ?4",
            params![name, sector.trim(), beacon.as_str(), id],
        )?;
        if changed == 0 {
            return Err(DirectoryError::NotFound { kind: "person", id });
        }
        Ok(Person {
            id,
            name: name.to_string(),
            sector: sector.trim().to_string(),
            beacon: beacon.clone(),
        })
    }

    /// Removes the person. Their history rows stay in the ledger.
    pub fn delete_person(&self, id: EntityId) -> Result<(), DirectoryError> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM people WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(DirectoryError::NotFound { kind: "person", id });
        }
        info!("[directory] deleted person {id}");
        Ok(())
    }

    pub fn list_people(&self) -> Result<Vec<Person>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, sector, beacon FROM people ORDER BY id")?;
        let rows = stmt.query_map([], person_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn register_gateway(
        &self,
        name: &str,
        sector: &str,
        address: &GatewayAddress,
    ) -> Result<Gateway, DirectoryError> {
        let name = required("name", name)?;
        if address.is_empty() {
            return Err(DirectoryError::InvalidInput { field: "address" });
        }
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM gateways WHERE address = ?1",
                params![address.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(DirectoryError::DuplicateGateway(address.clone()));
        }
        conn.execute(
            "INSERT INTO gateways (name, sector, address) VALUES (?1, ?2, ?3)",
            params![name, sector.trim(), address.as_str()],
        )?;
        let id = conn.last_insert_rowid();
        info!("[directory] registered gateway {id} at {address}");
        Ok(Gateway {
            id,
            name: name.to_string(),
            sector: sector.trim().to_string(),
            address: address.clone(),
        })
    }

    /// The address is the gateway's identity on the wire and cannot be changed.
    pub fn rename_gateway(
        &self,
        id: GatewayId,
        name: &str,
        sector: &str,
    ) -> Result<Gateway, DirectoryError> {
        let name = required("name", name)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE gateways SET name = ?1, sector = ?2 WHERE id = ?3",
            params![name, sector.trim(), id],
        )?;
        if changed == 0 {
            return Err(DirectoryError::NotFound { kind: "gateway", id });
        }
        let gateway = conn.query_row(
            "SELECT id, name, sector, address FROM gateways WHERE id = ?1",
            params![id],
            gateway_from_row,
        )?;
        Ok(gateway)
    }

    pub fn list_gateways(&self) -> Result<Vec<Gateway>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, sector, address FROM gateways ORDER BY id")?;
        let rows = stmt.query_map([], gateway_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

impl Directory for SqliteDirectory {
    fn person(&self, id: EntityId) -> Result<Option<Person>, DirectoryError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, sector, beacon FROM people WHERE id = ?1",
                params![id],
                person_from_row,
            )
            .optional()?)
    }

    fn person_by_beacon(&self, beacon: &BeaconId) -> Result<Option<Person>, DirectoryError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, sector, beacon FROM people WHERE beacon = ?1",
                params![beacon.as_str()],
                person_from_row,
            )
            .optional()?)
    }

    fn gateway(&self, id: GatewayId) -> Result<Option<Gateway>, DirectoryError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, sector, address FROM gateways WHERE id = ?1",
                params![id],
                gateway_from_row,
            )
            .optional()?)
    }

    fn gateway_by_address(
        &self,
        address: &GatewayAddress,
    ) -> Result<Option<Gateway>, DirectoryError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, sector, address FROM gateways WHERE address = ?1",
                params![address.as_str()],
                gateway_from_row,
            )
            .optional()?)
    }
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, DirectoryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        warn!("[directory] rejected empty {field}");
        return Err(DirectoryError::InvalidInput { field });
    }
    Ok(trimmed)
}

fn beacon_owner(conn: &Connection, beacon: &BeaconId) -> rusqlite::Result<Option<EntityId>> {
    conn.query_row(
        "SELECT id FROM people WHERE beacon = ?1",
        params![beacon.as_str()],
        |row| row.get(0),
    )
    .optional()
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        sector: row.get(2)?,
        beacon: BeaconId::from(row.get::<_, String>(3)?),
    })
}

fn gateway_from_row(row: &Row<'_>) -> rusqlite::Result<Gateway> {
    Ok(Gateway {
        id: row.get(0)?,
        name: row.get(1)?,
        sector: row.get(2)?,
        address: GatewayAddress::from(row.get::<_, String>(3)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_lookup_normalises_input() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let alice = dir
            .register_person("Alice", "north", &BeaconId::new("aa:bb:cc:dd:ee:01"))
            .unwrap();
        let found = dir
            .person_by_beacon(&BeaconId::new("AABBCCDDEE01"))
            .unwrap()
            .unwrap();
        assert_eq!(found, alice);
        assert!(
            dir.person_by_beacon(&BeaconId::new("AA:BB"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn duplicate_beacon_is_rejected() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let beacon = BeaconId::new("11:22:33:44:55:66");
        let first = dir.register_person("Alice", "north", &beacon).unwrap();
        let err = dir
            .register_person("Bob", "south", &BeaconId::new("112233445566"))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateBeacon(_)));

        let bob = dir
            .register_person("Bob", "south", &BeaconId::new("66:55:44:33:22:11"))
            .unwrap();
        let err = dir.update_person(bob.id, "Bob", "south", &beacon).unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateBeacon(_)));
        // keeping your own beacon is not a conflict
        dir.update_person(first.id, "Alice B", "east", &beacon).unwrap();
        assert_eq!(dir.person(first.id).unwrap().unwrap().sector, "east");
    }

    #[test]
    fn empty_fields_are_invalid() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let err = dir
            .register_person("  ", "north", &BeaconId::new("01"))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidInput { field: "name" }));
        let err = dir
            .register_gateway("Lobby", "north", &GatewayAddress::new(" "))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidInput { field: "address" }));
    }

    #[test]
    fn gateway_address_is_unique_and_immutable() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let address = GatewayAddress::new("ac:23:3f:00:00:01");
        let gw = dir.register_gateway("Lobby", "north", &address).unwrap();
        assert!(matches!(
            dir.register_gateway("Other", "south", &address),
            Err(DirectoryError::DuplicateGateway(_))
        ));
        let renamed = dir.rename_gateway(gw.id, "Front Lobby", "west").unwrap();
        assert_eq!(renamed.address, address);
        assert_eq!(
            dir.gateway_by_address(&GatewayAddress::new("AC233F000001"))
                .unwrap()
                .unwrap()
                .name,
            "Front Lobby"
        );
        assert!(matches!(
            dir.rename_gateway(999, "x", "y"),
            Err(DirectoryError::NotFound { kind: "gateway", .. })
        ));
    }

    #[test]
    fn delete_and_reopen_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("directory.db");
        let id = {
            let dir = SqliteDirectory::open(&path).unwrap();
            dir.register_gateway("Dock", "yard", &GatewayAddress::new("GW1"))
                .unwrap();
            dir.register_person("Alice", "yard", &BeaconId::new("B1"))
                .unwrap()
                .id
        };
        let dir = SqliteDirectory::open(&path).unwrap();
        assert_eq!(dir.list_people().unwrap().len(), 1);
        assert_eq!(dir.list_gateways().unwrap().len(), 1);
        dir.delete_person(id).unwrap();
        assert!(dir.person(id).unwrap().is_none());
        assert!(matches!(
            dir.delete_person(id),
            Err(DirectoryError::NotFound { kind: "person", .. })
        ));
    }
}
