pub mod schema;

use crate::error::ErrorSri;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct Database {
    pub conn: Mutex<Connection>,
}

impl Database {
    /// Abre (o crea) la base en disco y aplica el esquema
    pub fn abrir(db_path: &Path) -> Result<Self, ErrorSri> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)?;

        // Optimizaciones SQLite
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::con_esquema(conn)
    }

    /// Base en memoria, para tests
    pub fn en_memoria() -> Result<Self, ErrorSri> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::con_esquema(conn)
    }

    fn con_esquema(conn: Connection) -> Result<Self, ErrorSri> {
        schema::create_tables(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Bloquea la conexion. Nunca mantener el guard a traves de un `.await`.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, ErrorSri> {
        self.conn
            .lock()
            .map_err(|e| ErrorSri::Configuracion(format!("Conexion SQLite envenenada: {}", e)))
    }

    /// Configuracion clave/valor de un tenant
    pub fn leer_config(&self, tenant: &str) -> Result<HashMap<String, String>, ErrorSri> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config WHERE tenant = ?1")?;
        let filas = stmt
            .query_map(params![tenant], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<String, String>, _>>()?;
        Ok(filas)
    }

    pub fn guardar_config(&self, tenant: &str, key: &str, value: &str) -> Result<(), ErrorSri> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO config (tenant, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant, key) DO UPDATE SET value = excluded.value",
            params![tenant, key, value],
        )?;
        Ok(())
    }
}
