use std::str::FromStr;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::output::OutputType;
use crate::persistence::{
    ActuatorRecord, ActuatorStateRow, ConflictChecker, ConflictKind, PersistenceError, PinConflict, SafeState,
};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS actuators (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slot INTEGER NOT NULL DEFAULT 0,
        subslot INTEGER NOT NULL DEFAULT 0,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        gpio_pin INTEGER NOT NULL,
        gpio_chip TEXT NOT NULL,
        active_low INTEGER NOT NULL DEFAULT 0,
        safe_state TEXT NOT NULL DEFAULT 'OFF',
        min_on_time_ms INTEGER NOT NULL DEFAULT 0,
        max_on_time_ms INTEGER NOT NULL DEFAULT 0,
        pwm_frequency_hz INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS actuator_state (
        actuator_id INTEGER PRIMARY KEY,
        is_on INTEGER NOT NULL DEFAULT 0,
        pwm_duty INTEGER NOT NULL DEFAULT 0,
        total_on_time_ms INTEGER NOT NULL DEFAULT 0,
        cycle_count INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS sensors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        interface TEXT NOT NULL,
        gpio_pin INTEGER,
        gpio_chip TEXT
    )",
];

const ACTUATOR_COLUMNS: &str = "id, slot, subslot, name, type, gpio_pin, gpio_chip, active_low, safe_state, \
     min_on_time_ms, max_on_time_ms, pwm_frequency_hz, enabled";

pub struct ActuatorDatabase {
    pool: SqlitePool,
}

impl ActuatorDatabase {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file and bring the schema up.
    pub async fn open(path: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Self::new(pool);
        db.migrate().await?;
        info!("Opened actuator database {}", path);
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Returns the assigned id.
    pub async fn add_actuator(&self, record: &ActuatorRecord) -> Result<i64, PersistenceError> {
        let result = sqlx::query(
            "INSERT INTO actuators (slot, subslot, name, type, gpio_pin, gpio_chip, active_low, safe_state, \
             min_on_time_ms, max_on_time_ms, pwm_frequency_hz, enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(i64::from(record.slot))
        .bind(i64::from(record.subslot))
        .bind(&record.name)
        .bind(record.output_type.to_string())
        .bind(i64::from(record.gpio_pin))
        .bind(&record.gpio_chip)
        .bind(record.active_low)
        .bind(record.safe_state.to_string())
        .bind(i64::from(record.min_on_time_ms))
        .bind(i64::from(record.max_on_time_ms))
        .bind(i64::from(record.pwm_frequency_hz))
        .bind(record.enabled)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        debug!("Added actuator {} '{}'", id, record.name);
        Ok(id)
    }

    pub async fn update_actuator(&self, record: &ActuatorRecord) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            "UPDATE actuators SET slot = ?, subslot = ?, name = ?, type = ?, gpio_pin = ?, gpio_chip = ?, \
             active_low = ?, safe_state = ?, min_on_time_ms = ?, max_on_time_ms = ?, pwm_frequency_hz = ?, \
             enabled = ? WHERE id = ?",
        )
        .bind(i64::from(record.slot))
        .bind(i64::from(record.subslot))
        .bind(&record.name)
        .bind(record.output_type.to_string())
        .bind(i64::from(record.gpio_pin))
        .bind(&record.gpio_chip)
        .bind(record.active_low)
        .bind(record.safe_state.to_string())
        .bind(i64::from(record.min_on_time_ms))
        .bind(i64::from(record.max_on_time_ms))
        .bind(i64::from(record.pwm_frequency_hz))
        .bind(record.enabled)
        .bind(record.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(record.id));
        }
        Ok(())
    }

    /// Removes the actuator and its state row.
    pub async fn delete_actuator(&self, id: i64) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM actuator_state WHERE actuator_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM actuators WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(id));
        }
        tx.commit().await?;
        debug!("Deleted actuator {}", id);
        Ok(())
    }

    pub async fn get_actuator(&self, id: i64) -> Result<ActuatorRecord, PersistenceError> {
        let row = sqlx::query(&format!("SELECT {} FROM actuators WHERE id = ?", ACTUATOR_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PersistenceError::NotFound(id))?;
        record_from_row(&row)
    }

    pub async fn list_actuators(&self, enabled_only: bool) -> Result<Vec<ActuatorRecord>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM actuators{} ORDER BY id",
            ACTUATOR_COLUMNS,
            if enabled_only { " WHERE enabled = 1" } else { "" }
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn save_state(&self, state: &ActuatorStateRow) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO actuator_state (actuator_id, is_on, pwm_duty, total_on_time_ms, cycle_count, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(actuator_id) DO UPDATE SET is_on = excluded.is_on, pwm_duty = excluded.pwm_duty, \
             total_on_time_ms = excluded.total_on_time_ms, cycle_count = excluded.cycle_count, \
             updated_at = excluded.updated_at",
        )
        .bind(state.actuator_id)
        .bind(state.is_on)
        .bind(i64::from(state.pwm_duty))
        .bind(i64::try_from(state.total_on_time_ms).unwrap_or(i64::MAX))
        .bind(i64::from(state.cycle_count))
        .bind(state.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_state(&self, actuator_id: i64) -> Result<Option<ActuatorStateRow>, PersistenceError> {
        let row = sqlx::query(
            "SELECT actuator_id, is_on, pwm_duty, total_on_time_ms, cycle_count, updated_at \
             FROM actuator_state WHERE actuator_id = ?",
        )
        .bind(actuator_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let updated_at: i64 = row.try_get("updated_at")?;
        Ok(Some(ActuatorStateRow {
            actuator_id: row.try_get("actuator_id")?,
            is_on: row.try_get("is_on")?,
            pwm_duty: narrow(&row, "pwm_duty")?,
            total_on_time_ms: narrow(&row, "total_on_time_ms")?,
            cycle_count: narrow(&row, "cycle_count")?,
            updated_at: Utc
                .timestamp_millis_opt(updated_at)
                .single()
                .ok_or_else(|| bad_value("updated_at", updated_at))?,
        }))
    }

    /// Record a sensor wired to a GPIO line so actuators cannot claim it.
    pub async fn add_gpio_sensor(&self, name: &str, pin: u32, chip: &str) -> Result<i64, PersistenceError> {
        let result = sqlx::query("INSERT INTO sensors (name, interface, gpio_pin, gpio_chip) VALUES (?, 'gpio', ?, ?)")
            .bind(name)
            .bind(i64::from(pin))
            .bind(chip)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl ConflictChecker for ActuatorDatabase {
    async fn check_pin_conflict(
        &self,
        pin: u32,
        chip: &str,
        excluding_id: Option<i64>,
    ) -> Result<Option<PinConflict>, PersistenceError> {
        let actuator = sqlx::query(
            "SELECT id, name FROM actuators WHERE gpio_pin = ? AND gpio_chip = ? AND (? IS NULL OR id != ?) \
             ORDER BY id LIMIT 1",
        )
        .bind(i64::from(pin))
        .bind(chip)
        .bind(excluding_id)
        .bind(excluding_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = actuator {
            return Ok(Some(PinConflict {
                kind: ConflictKind::Actuator,
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            }));
        }

        let sensor = sqlx::query(
            "SELECT id, name FROM sensors WHERE interface = 'gpio' AND gpio_pin = ? AND gpio_chip = ? \
             ORDER BY id LIMIT 1",
        )
        .bind(i64::from(pin))
        .bind(chip)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match sensor {
            Some(row) => Some(PinConflict {
                kind: ConflictKind::Sensor,
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            }),
            None => None,
        })
    }
}

fn bad_value(column: &'static str, value: impl ToString) -> PersistenceError {
    PersistenceError::BadValue {
        column,
        value: value.to_string(),
    }
}

fn narrow<T: TryFrom<i64>>(row: &SqliteRow, column: &'static str) -> Result<T, PersistenceError> {
    let value: i64 = row.try_get(column)?;
    T::try_from(value).map_err(|_| bad_value(column, value))
}

fn record_from_row(row: &SqliteRow) -> Result<ActuatorRecord, PersistenceError> {
    let output_type: String = row.try_get("type")?;
    let safe_state: String = row.try_get("safe_state")?;
    Ok(ActuatorRecord {
        id: row.try_get("id")?,
        slot: narrow(row, "slot")?,
        subslot: narrow(row, "subslot")?,
        name: row.try_get("name")?,
        output_type: OutputType::from_str(&output_type).map_err(|_| bad_value("type", &output_type))?,
        gpio_pin: narrow(row, "gpio_pin")?,
        gpio_chip: row.try_get("gpio_chip")?,
        active_low: row.try_get("active_low")?,
        safe_state: SafeState::from_str(&safe_state).map_err(|_| bad_value("safe_state", &safe_state))?,
        min_on_time_ms: narrow(row, "min_on_time_ms")?,
        max_on_time_ms: narrow(row, "max_on_time_ms")?,
        pwm_frequency_hz: narrow(row, "pwm_frequency_hz")?,
        enabled: row.try_get("enabled")?,
    })
}
