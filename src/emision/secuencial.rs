use crate::db::Database;
use crate::error::ErrorSri;
use crate::models::TipoComprobante;
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mayor secuencial que cabe en 9 digitos
pub const SECUENCIAL_MAXIMO: u64 = 999_999_999;

/// Servicio que asigna secuenciales unicos por (tenant, establecimiento,
/// punto de emision, tipo de comprobante).
pub trait ContadorSecuencial: Send + Sync {
    fn siguiente(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
    ) -> Result<u64, ErrorSri>;

    /// Deja constancia de un secuencial asignado que no llego a usarse.
    /// El numero no se reutiliza.
    fn registrar_hueco(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
        secuencial: u64,
        motivo: &str,
    ) -> Result<(), ErrorSri>;
}

/// Secuencial perdido, con la causa
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HuecoSecuencial {
    pub establecimiento: String,
    pub punto_emision: String,
    pub cod_doc: String,
    pub secuencial: u64,
    pub motivo: String,
    pub fecha: String,
}

/// Contador sobre la tabla `secuenciales`, incrementado en una transaccion IMMEDIATE
pub struct ContadorSqlite {
    db: Arc<Database>,
}

impl ContadorSqlite {
    pub fn nuevo(db: Arc<Database>) -> Self {
        ContadorSqlite { db }
    }

    /// Ajusta el ultimo secuencial usado (migracion desde otro sistema)
    pub fn fijar_ultimo(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
        ultimo: u64,
    ) -> Result<(), ErrorSri> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO secuenciales (tenant, establecimiento, punto_emision, cod_doc, ultimo)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant, establecimiento, punto_emision, cod_doc)
             DO UPDATE SET ultimo = excluded.ultimo",
            params![tenant, establecimiento, punto_emision, tipo.codigo(), ultimo as i64],
        )?;
        Ok(())
    }

    /// Huecos registrados del tenant, en orden de registro
    pub fn huecos(&self, tenant: &str) -> Result<Vec<HuecoSecuencial>, ErrorSri> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT establecimiento, punto_emision, cod_doc, secuencial, motivo, fecha
             FROM secuenciales_huecos WHERE tenant = ?1 ORDER BY id",
        )?;
        let filas = stmt
            .query_map(params![tenant], |row| {
                Ok(HuecoSecuencial {
                    establecimiento: row.get(0)?,
                    punto_emision: row.get(1)?,
                    cod_doc: row.get(2)?,
                    secuencial: row.get::<_, i64>(3)? as u64,
                    motivo: row.get(4)?,
                    fecha: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(filas)
    }
}

impl ContadorSecuencial for ContadorSqlite {
    fn siguiente(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
    ) -> Result<u64, ErrorSri> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let siguiente: i64 = tx.query_row(
            "INSERT INTO secuenciales (tenant, establecimiento, punto_emision, cod_doc, ultimo)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(tenant, establecimiento, punto_emision, cod_doc)
             DO UPDATE SET ultimo = ultimo + 1
             RETURNING ultimo",
            params![tenant, establecimiento, punto_emision, tipo.codigo()],
            |row| row.get(0),
        )?;

        let siguiente = siguiente as u64;
        if siguiente > SECUENCIAL_MAXIMO {
            // rollback al soltar tx
            return Err(ErrorSri::Validacion(format!(
                "Secuencial agotado para {}-{} ({})",
                establecimiento,
                punto_emision,
                tipo.codigo()
            )));
        }

        tx.commit()?;
        debug!(tenant, establecimiento, punto_emision, secuencial = siguiente, "Secuencial asignado");
        Ok(siguiente)
    }

    fn registrar_hueco(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
        secuencial: u64,
        motivo: &str,
    ) -> Result<(), ErrorSri> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO secuenciales_huecos
                (tenant, establecimiento, punto_emision, cod_doc, secuencial, motivo)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![tenant, establecimiento, punto_emision, tipo.codigo(), secuencial as i64, motivo],
        )?;
        warn!(tenant, establecimiento, punto_emision, secuencial, motivo, "Secuencial sin comprobante");
        Ok(())
    }
}
