//! SQLite implementation of [`Store`].
//!
//! One connection guarded by a mutex. Every public call takes the lock for its
//! whole duration, so multi-statement writes are serialised with respect to
//! each other as well as wrapped in a transaction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::{PlateRecord, Store};
use crate::error::{ResourceError, SdlError, SdlResult};
use crate::experiment::{
    Artifact, ArtifactKind, Experiment, ExperimentResults, ExperimentStatus, ProtocolParams,
    SolutionSpec,
};
use crate::labware::{Contents, Coordinates, Vessel, VesselKind};
use crate::scheduler::queue::QueueEntry;
use crate::scheduler::system_state::SystemState;

const SCHEMA_VERSION: i64 = 1;

const VESSEL_COLUMNS: &str = "id, grp, kind, name, volume, capacity, dead_volume, contents_json, \
     concentration, x, y, z, height, radius, base_thickness, viscosity_cp, density, active, \
     status, experiment_id, project_id";

#[derive(Debug, thiserror::Error)]
#[error("unrecognised {what}: {value}")]
struct BadColumn {
    what: &'static str,
    value: String,
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn parse_status(column: usize, raw: &str) -> rusqlite::Result<ExperimentStatus> {
    raw.parse().map_err(|e| conversion_error(column, e))
}

fn vessel_from_row(row: &Row<'_>) -> rusqlite::Result<Vessel> {
    let kind_raw: String = row.get(2)?;
    let kind = VesselKind::parse(&kind_raw).ok_or_else(|| {
        conversion_error(
            2,
            BadColumn {
                what: "vessel kind",
                value: kind_raw.clone(),
            },
        )
    })?;
    let contents_raw: String = row.get(7)?;
    let contents: Contents =
        serde_json::from_str(&contents_raw).map_err(|e| conversion_error(7, e))?;
    let status = row
        .get::<_, Option<String>>(18)?
        .map(|s| parse_status(18, &s))
        .transpose()?;

    Ok(Vessel {
        id: row.get(0)?,
        group: row.get(1)?,
        kind,
        name: row.get(3)?,
        volume: row.get(4)?,
        capacity: row.get(5)?,
        dead_volume: row.get(6)?,
        contents,
        concentration: row.get(8)?,
        coordinates: Coordinates::new(row.get(9)?, row.get(10)?, row.get(11)?),
        height: row.get(12)?,
        radius: row.get(13)?,
        base_thickness: row.get(14)?,
        viscosity_cp: row.get(15)?,
        density: row.get(16)?,
        active: row.get(17)?,
        status,
        experiment_id: row.get(19)?,
        project_id: row.get(20)?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let kind_raw: String = row.get(0)?;
    let kind = ArtifactKind::parse(&kind_raw).ok_or_else(|| {
        conversion_error(
            0,
            BadColumn {
                what: "artifact kind",
                value: kind_raw.clone(),
            },
        )
    })?;
    let created_raw: String = row.get(5)?;
    Ok(Artifact {
        kind,
        context: row.get(1)?,
        path: row.get::<_, Option<String>>(2)?.map(Into::into),
        passed: row.get(3)?,
        value: row.get(4)?,
        created_at: parse_timestamp(5, &created_raw)?,
    })
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) a database file. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> SdlResult<Self> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SdlResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SdlResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> SdlResult<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> SdlResult<()> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(SdlError::Configuration(format!(
                "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        if current < 1 {
            let conn = self.conn.lock();
            conn.execute_batch(include_str!("../../migrations/0001_lab_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            tracing::debug!("Applied schema migration 1");
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn add_plate(&self, plate: PlateRecord, activate: bool) -> SdlResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO plates (id, type_id, active) VALUES (?1, ?2, 0)",
            params![plate.id, plate.type_id],
        )?;
        if activate {
            tx.execute("UPDATE plates SET active = (id = ?1)", [plate.id])?;
            tx.execute(
                "UPDATE vessels SET active = (grp = ?1) WHERE kind = 'well'",
                [plate.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn active_plate(&self) -> SdlResult<Option<PlateRecord>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, type_id FROM plates WHERE active = 1 LIMIT 1",
                [],
                |row| {
                    Ok(PlateRecord {
                        id: row.get(0)?,
                        type_id: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    fn upsert_vessel(&self, vessel: &Vessel) -> SdlResult<()> {
        let contents = serde_json::to_string(&vessel.contents)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO vessels ({VESSEL_COLUMNS}, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22)"
            ),
            params![
                vessel.id,
                vessel.group,
                vessel.kind.as_str(),
                vessel.name,
                vessel.volume,
                vessel.capacity,
                vessel.dead_volume,
                contents,
                vessel.concentration,
                vessel.coordinates.x,
                vessel.coordinates.y,
                vessel.coordinates.z,
                vessel.height,
                vessel.radius,
                vessel.base_thickness,
                vessel.viscosity_cp,
                vessel.density,
                vessel.active,
                vessel.status.map(|s| s.as_str()),
                vessel.experiment_id,
                vessel.project_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn save_vessel_contents(&self, vessel: &Vessel) -> SdlResult<()> {
        let contents = serde_json::to_string(&vessel.contents)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE vessels SET volume = ?1, contents_json = ?2, updated_at = ?3 \
             WHERE grp = ?4 AND id = ?5 AND kind = ?6",
            params![
                vessel.volume,
                contents,
                Utc::now().to_rfc3339(),
                vessel.group,
                vessel.id,
                vessel.kind.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(ResourceError::UnknownVessel(vessel.id.clone()).into());
        }
        Ok(())
    }

    fn load_vessels(&self) -> SdlResult<Vec<Vessel>> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(&format!(
            "SELECT {VESSEL_COLUMNS} FROM vessels \
             WHERE active = 1 \
               AND (kind != 'well' OR grp = (SELECT id FROM plates WHERE active = 1)) \
             ORDER BY kind, grp, id"
        ))?;
        let rows = statement.query_map([], vessel_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn well_status(&self, well_id: &str) -> SdlResult<Option<ExperimentStatus>> {
        let conn = self.conn.lock();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT status FROM vessels \
                 WHERE kind = 'well' AND id = ?1 \
                   AND grp = (SELECT id FROM plates WHERE active = 1)",
                [well_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .flatten()
            .map(|s| parse_status(0, &s))
            .transpose()?)
    }

    fn insert_experiment(&self, experiment: &mut Experiment) -> SdlResult<i64> {
        let solutions = serde_json::to_string(&experiment.solutions)?;
        let parameters = experiment
            .params
            .parameters()
            .into_iter()
            .map(|(name, value)| Ok((name, serde_json::to_string(&value)?)))
            .collect::<SdlResult<Vec<_>>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if experiment.plate_id.is_none() {
            experiment.plate_id = tx
                .query_row("SELECT id FROM plates WHERE active = 1 LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
        }

        let id: Option<i64> = (experiment.experiment_id != 0).then_some(experiment.experiment_id);
        tx.execute(
            "INSERT INTO experiments (experiment_id, name, priority, well_id, plate_id, \
             project_id, project_campaign_id, protocol_id, solutions_json, status, status_date, \
             needs_analysis) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                experiment.name,
                experiment.priority,
                experiment.well_id,
                experiment.plate_id,
                experiment.project_id,
                experiment.project_campaign_id,
                experiment.protocol_id,
                solutions,
                experiment.status.as_str(),
                experiment.status_date.to_rfc3339(),
                experiment.needs_analysis,
            ],
        )?;
        let experiment_id = tx.last_insert_rowid();

        for (name, value) in &parameters {
            tx.execute(
                "INSERT OR REPLACE INTO experiment_parameters (experiment_id, name, value_json) \
                 VALUES (?1, ?2, ?3)",
                params![experiment_id, name, value],
            )?;
        }

        if let Some(plate_id) = experiment.plate_id {
            tx.execute(
                "UPDATE vessels SET status = ?1, experiment_id = ?2, project_id = ?3 \
                 WHERE kind = 'well' AND id = ?4 AND grp = ?5",
                params![
                    experiment.status.as_str(),
                    experiment_id,
                    experiment.project_id,
                    experiment.well_id,
                    plate_id,
                ],
            )?;
        }
        tx.commit()?;

        experiment.experiment_id = experiment_id;
        Ok(experiment_id)
    }

    fn load_experiment(&self, experiment_id: i64) -> SdlResult<Option<Experiment>> {
        let conn = self.conn.lock();
        let Some(mut experiment) = conn
            .query_row(
                "SELECT experiment_id, name, priority, well_id, plate_id, project_id, \
                 project_campaign_id, protocol_id, solutions_json, status, status_date, \
                 needs_analysis FROM experiments WHERE experiment_id = ?1",
                [experiment_id],
                |row| {
                    let solutions_raw: String = row.get(8)?;
                    let solutions: BTreeMap<String, SolutionSpec> =
                        serde_json::from_str(&solutions_raw).map_err(|e| conversion_error(8, e))?;
                    let status_raw: String = row.get(9)?;
                    let date_raw: String = row.get(10)?;
                    Ok(Experiment {
                        experiment_id: row.get(0)?,
                        name: row.get(1)?,
                        priority: row.get(2)?,
                        well_id: row.get(3)?,
                        plate_id: row.get(4)?,
                        project_id: row.get(5)?,
                        project_campaign_id: row.get(6)?,
                        protocol_id: row.get(7)?,
                        solutions,
                        status: parse_status(9, &status_raw)?,
                        status_date: parse_timestamp(10, &date_raw)?,
                        params: ProtocolParams::Base,
                        results: ExperimentResults::default(),
                        needs_analysis: row.get(11)?,
                    })
                },
            )
            .optional()?
        else {
            return Ok(None);
        };

        let mut statement = conn.prepare(
            "SELECT name, value_json FROM experiment_parameters WHERE experiment_id = ?1 \
             ORDER BY name",
        )?;
        let rows = statement
            .query_map([experiment_id], |row| {
                let raw: String = row.get(1)?;
                let value: Value = serde_json::from_str(&raw).map_err(|e| conversion_error(1, e))?;
                Ok((row.get::<_, String>(0)?, value))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        experiment.params = ProtocolParams::from_rows(&experiment.protocol_id, &rows)?;

        let mut statement = conn.prepare(
            "SELECT kind, context, path, passed, value, created_at FROM experiment_results \
             WHERE experiment_id = ?1 ORDER BY id",
        )?;
        let artifacts = statement
            .query_map([experiment_id], artifact_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        experiment.results = ExperimentResults::from_artifacts(artifacts);

        Ok(Some(experiment))
    }

    fn queued_experiments(&self) -> SdlResult<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT experiment_id, priority, well_id FROM experiments \
             WHERE status = ?1 ORDER BY priority, experiment_id",
        )?;
        let rows = statement.query_map([ExperimentStatus::Queued.as_str()], |row| {
            Ok(QueueEntry {
                experiment_id: row.get(0)?,
                priority: row.get(1)?,
                well_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn record_status(&self, experiment: &Experiment) -> SdlResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE experiments SET status = ?1, status_date = ?2 WHERE experiment_id = ?3",
            params![
                experiment.status.as_str(),
                experiment.status_date.to_rfc3339(),
                experiment.experiment_id,
            ],
        )?;
        if changed == 0 {
            return Err(SdlError::ExperimentNotFound(experiment.experiment_id));
        }
        let well_changed = match experiment.plate_id {
            Some(plate_id) => tx.execute(
                "UPDATE vessels SET status = ?1, experiment_id = ?2, project_id = ?3 \
                 WHERE kind = 'well' AND id = ?4 AND grp = ?5",
                params![
                    experiment.status.as_str(),
                    experiment.experiment_id,
                    experiment.project_id,
                    experiment.well_id,
                    plate_id,
                ],
            )?,
            None => 0,
        };
        tx.commit()?;
        if well_changed == 0 {
            tracing::warn!(
                experiment_id = experiment.experiment_id,
                well_id = %experiment.well_id,
                "No well record to mirror experiment status onto"
            );
        }
        Ok(())
    }

    fn set_priority(&self, experiment_id: i64, priority: i64) -> SdlResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE experiments SET priority = ?1 WHERE experiment_id = ?2",
            params![priority, experiment_id],
        )?;
        if changed == 0 {
            return Err(SdlError::ExperimentNotFound(experiment_id));
        }
        Ok(())
    }

    fn append_artifact(&self, experiment_id: i64, artifact: &Artifact) -> SdlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO experiment_results (experiment_id, kind, context, path, passed, value, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                experiment_id,
                artifact.kind.as_str(),
                artifact.context,
                artifact
                    .path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                artifact.passed,
                artifact.value,
                artifact.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn set_needs_analysis(&self, experiment_id: i64, needs_analysis: bool) -> SdlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE experiments SET needs_analysis = ?1 WHERE experiment_id = ?2",
            params![needs_analysis, experiment_id],
        )?;
        Ok(())
    }

    fn system_state(&self) -> SdlResult<Option<SystemState>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT state FROM system_status WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|s| {
            s.parse()
                .map_err(|_| SdlError::Configuration(format!("unknown system state '{s}'")))
        })
        .transpose()
    }

    fn set_system_state(&self, state: SystemState, note: &str) -> SdlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_status (id, state, note, updated_at) VALUES (1, ?1, ?2, ?3) \
             ON CONFLICT (id) DO UPDATE SET state = excluded.state, note = excluded.note, \
             updated_at = excluded.updated_at",
            params![state.as_str(), note, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
