//! Durable store of device configuration. CRUD plus a `ConfigChanged`
//! signal the Scheduler watches to know when to reload at the next cycle
//! boundary.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::config::ALLOWED_BAUD_RATES;
use crate::db::Db;
use crate::error::RegistryError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub com_port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    pub start_reg: u16,
    pub function_code: u8,
    pub register_count: u16,
    /// When `register_count == 2`, whether the second register carries an
    /// independent ambient-temperature reading (two signed 16-bit values)
    /// rather than the high half of a 32-bit float. See §4.1.
    pub ambient_in_second_register: bool,
    pub graph: bool,
    pub graph_y_min: f32,
    pub graph_y_max: f32,
    pub enabled: bool,
}

/// Input shape for create/update; identical to `Device` minus the
/// server-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDto {
    pub name: String,
    pub com_port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    pub start_reg: u16,
    pub function_code: u8,
    pub register_count: u16,
    pub ambient_in_second_register: bool,
    pub graph: bool,
    pub graph_y_min: f32,
    pub graph_y_max: f32,
    pub enabled: bool,
}

fn validate(dto: &DeviceDto) -> Result<(), RegistryError> {
    if dto.name.trim().is_empty() {
        return Err(RegistryError::Validation("name must not be empty".into()));
    }
    if !ALLOWED_BAUD_RATES.contains(&dto.baud_rate) {
        return Err(RegistryError::Validation(format!(
            "baud rate {} is not one of the allowed values",
            dto.baud_rate
        )));
    }
    if dto.slave_id < 1 || dto.slave_id > 247 {
        return Err(RegistryError::Validation(
            "slave id must be in 1..=247".into(),
        ));
    }
    if !matches!(dto.function_code, 3 | 4) {
        return Err(RegistryError::Validation(
            "function code must be 3 or 4".into(),
        ));
    }
    if !matches!(dto.register_count, 1 | 2) {
        return Err(RegistryError::Validation(
            "register count must be 1 or 2".into(),
        ));
    }
    if dto.graph_y_min >= dto.graph_y_max {
        return Err(RegistryError::Validation(
            "graph_y_min must be less than graph_y_max".into(),
        ));
    }
    if dto.ambient_in_second_register && dto.register_count != 2 {
        return Err(RegistryError::Validation(
            "ambient_in_second_register requires register_count = 2".into(),
        ));
    }
    Ok(())
}

fn row_to_device(row: &Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get("id")?,
        name: row.get("name")?,
        com_port: row.get("com_port")?,
        baud_rate: row.get("baud_rate")?,
        slave_id: row.get::<_, i64>("slave_id")? as u8,
        start_reg: row.get::<_, i64>("start_reg")? as u16,
        function_code: row.get::<_, i64>("function_code")? as u8,
        register_count: row.get::<_, i64>("register_count")? as u16,
        ambient_in_second_register: row.get::<_, i64>("ambient_in_second_register")? != 0,
        graph: row.get::<_, i64>("graph")? != 0,
        graph_y_min: row.get("graph_y_min")?,
        graph_y_max: row.get("graph_y_max")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
    })
}

#[derive(Clone)]
pub struct DeviceRegistry {
    db: Db,
    config_changed_tx: tokio::sync::watch::Sender<()>,
}

impl DeviceRegistry {
    pub fn new(db: Db) -> Self {
        let (config_changed_tx, _rx) = tokio::sync::watch::channel(());
        DeviceRegistry {
            db,
            config_changed_tx,
        }
    }

    /// Subscribe to the `ConfigChanged` signal; a new value is published on
    /// every successful Create/Update/Delete.
    pub fn watch_changes(&self) -> tokio::sync::watch::Receiver<()> {
        self.config_changed_tx.subscribe()
    }

    fn notify_changed(&self) {
        let _ = self.config_changed_tx.send(());
    }

    pub async fn list(&self, enabled_only: bool) -> Result<Vec<Device>, RegistryError> {
        self.db
            .with_conn(move |conn| -> rusqlite::Result<Vec<Device>> {
                let sql = if enabled_only {
                    "SELECT * FROM devices WHERE enabled = 1 ORDER BY id"
                } else {
                    "SELECT * FROM devices ORDER BY id"
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map([], row_to_device)?;
                rows.collect()
            })
            .await
            .map_err(RegistryError::from)
    }

    pub async fn get(&self, id: i64) -> Result<Device, RegistryError> {
        let found = self
            .db
            .with_conn(move |conn| -> rusqlite::Result<Option<Device>> {
                conn.query_row("SELECT * FROM devices WHERE id = ?1", params![id], row_to_device)
                    .optional()
            })
            .await?;
        found.ok_or(RegistryError::NotFound(id))
    }

    /// Used by the Parameter Service to resolve a registered device's
    /// `baud_rate` from the (com_port, slave_id) pair a pyrometer request
    /// addresses, so callers don't have to pass it explicitly.
    pub async fn find_by_com_port_and_slave_id(
        &self,
        com_port: &str,
        slave_id: u8,
    ) -> Result<Option<Device>, RegistryError> {
        let com_port = com_port.to_string();
        self.db
            .with_conn(move |conn| -> rusqlite::Result<Option<Device>> {
                conn.query_row(
                    "SELECT * FROM devices WHERE com_port = ?1 AND slave_id = ?2",
                    params![com_port, slave_id],
                    row_to_device,
                )
                .optional()
            })
            .await
            .map_err(RegistryError::from)
    }

    pub async fn create(&self, dto: DeviceDto) -> Result<Device, RegistryError> {
        validate(&dto)?;
        let dto_name_for_err = dto.name.clone();
        let id = self
            .db
            .with_conn(move |conn| -> rusqlite::Result<i64> {
                conn.execute(
                    "INSERT INTO devices
                     (name, com_port, baud_rate, slave_id, start_reg, function_code,
                      register_count, ambient_in_second_register, graph, graph_y_min,
                      graph_y_max, enabled)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        dto.name,
                        dto.com_port,
                        dto.baud_rate,
                        dto.slave_id,
                        dto.start_reg,
                        dto.function_code,
                        dto.register_count,
                        dto.ambient_in_second_register as i64,
                        dto.graph as i64,
                        dto.graph_y_min,
                        dto.graph_y_max,
                        dto.enabled as i64,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(e, _)
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RegistryError::Conflict(dto_name_for_err.clone())
                }
                other => RegistryError::from(other),
            })?;
        self.notify_changed();
        self.get(id).await
    }

    /// `com_port` and `slave_id` are a device's wire identity: changing
    /// either one on an Update is rejected rather than silently applied,
    /// since the Scheduler groups and orders in-flight work by exactly
    /// these two fields. A caller that wants to re-address a device must
    /// delete and re-create it.
    pub async fn update(&self, id: i64, dto: DeviceDto) -> Result<Device, RegistryError> {
        validate(&dto)?;
        let existing = self.get(id).await?; // 404 if missing
        if dto.com_port != existing.com_port || dto.slave_id != existing.slave_id {
            return Err(RegistryError::Validation(
                "com_port and slave_id are immutable; delete and re-create the device instead".into(),
            ));
        }
        let name_for_conflict = dto.name.clone();
        let affected = self
            .db
            .with_conn(move |conn| -> rusqlite::Result<usize> {
                conn.execute(
                    "UPDATE devices SET name=?1, com_port=?2, baud_rate=?3, slave_id=?4,
                     start_reg=?5, function_code=?6, register_count=?7,
                     ambient_in_second_register=?8, graph=?9, graph_y_min=?10,
                     graph_y_max=?11, enabled=?12 WHERE id=?13",
                    params![
                        dto.name,
                        dto.com_port,
                        dto.baud_rate,
                        dto.slave_id,
                        dto.start_reg,
                        dto.function_code,
                        dto.register_count,
                        dto.ambient_in_second_register as i64,
                        dto.graph as i64,
                        dto.graph_y_min,
                        dto.graph_y_max,
                        dto.enabled as i64,
                        id,
                    ],
                )
            })
            .await
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(e, _)
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RegistryError::Conflict(name_for_conflict.clone())
                }
                other => RegistryError::from(other),
            })?;
        if affected == 0 {
            return Err(RegistryError::NotFound(id));
        }
        self.notify_changed();
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RegistryError> {
        let affected = self
            .db
            .with_conn(move |conn| conn.execute("DELETE FROM devices WHERE id = ?1", params![id]))
            .await?;
        if affected == 0 {
            return Err(RegistryError::NotFound(id));
        }
        self.notify_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dto(name: &str) -> DeviceDto {
        DeviceDto {
            name: name.into(),
            com_port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            slave_id: 1,
            start_reg: 0,
            function_code: 3,
            register_count: 1,
            ambient_in_second_register: false,
            graph: true,
            graph_y_min: 0.0,
            graph_y_max: 100.0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let created = registry.create(sample_dto("probe-1")).await.unwrap();
        let fetched = registry.get(created.id).await.unwrap();
        assert_eq!(created, fetched);
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        registry.create(sample_dto("probe-1")).await.unwrap();
        let err = registry.create(sample_dto("probe-1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_baud_is_rejected() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let mut dto = sample_dto("probe-1");
        dto.baud_rate = 4242;
        let err = registry.create(dto).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_register_count_is_rejected() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let mut dto = sample_dto("probe-1");
        dto.register_count = 3;
        let err = registry.create(dto).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let err = registry.get(999).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(999)));
    }

    #[tokio::test]
    async fn update_notifies_watchers() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let created = registry.create(sample_dto("probe-1")).await.unwrap();
        let mut watcher = registry.watch_changes();
        let mut dto = sample_dto("probe-1");
        dto.enabled = false;
        registry.update(created.id, dto).await.unwrap();
        assert!(watcher.has_changed().unwrap());
    }

    #[tokio::test]
    async fn find_by_com_port_and_slave_id_matches_the_registered_device() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let created = registry.create(sample_dto("probe-1")).await.unwrap();
        let found = registry
            .find_by_com_port_and_slave_id(&created.com_port, created.slave_id)
            .await
            .unwrap();
        assert_eq!(found, Some(created));
    }

    #[tokio::test]
    async fn update_rejects_com_port_change() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let created = registry.create(sample_dto("probe-1")).await.unwrap();
        let mut dto = sample_dto("probe-1");
        dto.com_port = "/dev/ttyUSB1".into();
        let err = registry.update(created.id, dto).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn update_rejects_slave_id_change() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let created = registry.create(sample_dto("probe-1")).await.unwrap();
        let mut dto = sample_dto("probe-1");
        dto.slave_id = 2;
        let err = registry.update(created.id, dto).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn ambient_in_second_register_requires_two_registers() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let mut dto = sample_dto("probe-1");
        dto.register_count = 1;
        dto.ambient_in_second_register = true;
        let err = registry.create(dto).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn find_by_com_port_and_slave_id_is_none_when_unregistered() {
        let registry = DeviceRegistry::new(Db::open_in_memory().unwrap());
        let found = registry
            .find_by_com_port_and_slave_id("/dev/ttyUSB9", 42)
            .await
            .unwrap();
        assert_eq!(found, None);
    }
}
