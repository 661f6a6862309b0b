use crate::db::Database;
use crate::emision::estados::{EvidenciaAnulacion, MaquinaEstados};
use crate::error::ErrorSri;
use crate::models::{Comprobante, EstadoComprobante, TipoComprobante, Transicion};
use crate::sri::clave_acceso::ClaveAcceso;
use crate::sri::impuestos::redondear2;
use crate::sri::respuesta::MensajeSri;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::debug;

const COLUMNAS: &str = "id, tenant, cod_doc, clave_acceso, numero, fecha_emision, estado, importe_total,
     xml, xml_firmado, numero_autorizacion, fecha_autorizacion, documento_modificado";

/// Tolerancia para comparar montos ya redondeados a 2 decimales
const TOLERANCIA: f64 = 0.005;

/// Datos para registrar un comprobante nuevo (estado BORRADOR)
#[derive(Debug, Clone)]
pub struct NuevoComprobante {
    pub tenant: String,
    pub tipo: TipoComprobante,
    pub clave_acceso: ClaveAcceso,
    pub numero: String,
    pub fecha_emision: NaiveDate,
    pub importe_total: f64,
    pub documento_modificado: Option<ClaveAcceso>,
}

/// Columnas que se actualizan junto con una transicion (None = sin cambio)
#[derive(Debug, Clone, Default)]
pub struct DatosTransicion {
    pub detalle: Option<String>,
    pub xml: Option<String>,
    pub xml_firmado: Option<String>,
    pub numero_autorizacion: Option<String>,
    pub fecha_autorizacion: Option<String>,
}

impl DatosTransicion {
    pub fn detalle(detalle: impl Into<String>) -> Self {
        DatosTransicion {
            detalle: Some(detalle.into()),
            ..Default::default()
        }
    }
}

/// Mensaje del SRI guardado con la etapa en que llego
#[derive(Debug, Clone, PartialEq)]
pub struct MensajeGuardado {
    pub etapa: String,
    pub mensaje: MensajeSri,
}

/// Acceso a `comprobantes`, `comprobante_transiciones` y `comprobante_mensajes`
#[derive(Clone)]
pub struct RepositorioComprobantes {
    db: Arc<Database>,
}

impl RepositorioComprobantes {
    pub fn nuevo(db: Arc<Database>) -> Self {
        RepositorioComprobantes { db }
    }

    /// Inserta el comprobante en BORRADOR y registra la transicion inicial.
    pub fn crear(&self, nuevo: &NuevoComprobante) -> Result<Comprobante, ErrorSri> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let id = insertar_borrador(&tx, nuevo)?;
        tx.commit()?;

        debug!(id, clave_acceso = %nuevo.clave_acceso, "Comprobante creado");
        buscar_por_id(&conn, id)
    }

    /// Inserta una nota de credito solo si, sumada a las notas vigentes de la
    /// misma factura, no pasa de `tope`. Las notas DEVUELTO o NO_AUTORIZADO
    /// no cuentan. Suma e insercion van en una transaccion IMMEDIATE, asi dos
    /// notas simultaneas no pueden ver el mismo saldo.
    pub fn crear_nota_credito(&self, nuevo: &NuevoComprobante, tope: f64) -> Result<Comprobante, ErrorSri> {
        let factura = nuevo.documento_modificado.as_ref().ok_or_else(|| {
            ErrorSri::Validacion("La nota de credito no indica la factura que modifica".to_string())
        })?;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let acreditado: f64 = tx.query_row(
            "SELECT COALESCE(SUM(importe_total), 0.0) FROM comprobantes
             WHERE tenant = ?1 AND documento_modificado = ?2 AND estado NOT IN (?3, ?4)",
            params![
                nuevo.tenant,
                factura.as_str(),
                EstadoComprobante::Devuelto.as_str(),
                EstadoComprobante::NoAutorizado.as_str(),
            ],
            |row| row.get(0),
        )?;
        let acreditado = redondear2(acreditado);
        if acreditado + nuevo.importe_total > tope + TOLERANCIA {
            // rollback al soltar tx
            return Err(ErrorSri::Validacion(format!(
                "La nota de credito ({:.2}) supera el saldo de la factura ({:.2})",
                nuevo.importe_total,
                redondear2(tope - acreditado)
            )));
        }

        let id = insertar_borrador(&tx, nuevo)?;
        tx.commit()?;

        debug!(id, clave_acceso = %nuevo.clave_acceso, factura = %factura, acreditado, "Nota de credito creada");
        buscar_por_id(&conn, id)
    }

    /// Avanza el estado validando con la maquina de estados. La actualizacion
    /// es condicional al estado leido, asi dos emisiones concurrentes del mismo
    /// comprobante no pueden aplicar la misma transicion.
    pub fn transicionar(
        &self,
        id: i64,
        hacia: EstadoComprobante,
        datos: DatosTransicion,
    ) -> Result<Comprobante, ErrorSri> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let actual = buscar_por_id(&tx, id)?;
        let mut maquina = MaquinaEstados::desde(actual.estado);
        let desde = maquina.aplicar(hacia)?;

        actualizar_estado(&tx, id, desde, hacia, &datos)?;
        insertar_transicion(&tx, id, Some(desde), hacia, datos.detalle.as_deref())?;
        tx.commit()?;

        debug!(id, desde = %desde, hacia = %hacia, "Transicion aplicada");
        buscar_por_id(&conn, id)
    }

    /// AUTORIZADO -> ANULADO
    pub fn anular(&self, id: i64, evidencia: &EvidenciaAnulacion) -> Result<Comprobante, ErrorSri> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let actual = buscar_por_id(&tx, id)?;
        let mut maquina = MaquinaEstados::desde(actual.estado);
        let desde = maquina.anular(evidencia)?;

        let detalle = format!(
            "Anulada por nota de credito {} (autorizacion {})",
            evidencia.clave_nota_credito, evidencia.numero_autorizacion
        );
        actualizar_estado(&tx, id, desde, EstadoComprobante::Anulado, &DatosTransicion::default())?;
        insertar_transicion(&tx, id, Some(desde), EstadoComprobante::Anulado, Some(&detalle))?;
        tx.commit()?;

        buscar_por_id(&conn, id)
    }

    pub fn guardar_mensajes(&self, id: i64, etapa: &str, mensajes: &[MensajeSri]) -> Result<(), ErrorSri> {
        if mensajes.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        for m in mensajes {
            tx.execute(
                "INSERT INTO comprobante_mensajes
                    (comprobante_id, etapa, identificador, mensaje, informacion_adicional, tipo)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, etapa, m.identificador, m.mensaje, m.informacion_adicional, m.tipo],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mensajes(&self, id: i64) -> Result<Vec<MensajeGuardado>, ErrorSri> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT etapa, identificador, mensaje, informacion_adicional, tipo
             FROM comprobante_mensajes WHERE comprobante_id = ?1 ORDER BY id",
        )?;
        let filas = stmt
            .query_map(params![id], |row| {
                Ok(MensajeGuardado {
                    etapa: row.get(0)?,
                    mensaje: MensajeSri {
                        identificador: row.get(1)?,
                        mensaje: row.get(2)?,
                        informacion_adicional: row.get(3)?,
                        tipo: row.get(4)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(filas)
    }

    pub fn buscar_por_clave(&self, tenant: &str, clave: &ClaveAcceso) -> Result<Option<Comprobante>, ErrorSri> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM comprobantes WHERE tenant = ?1 AND clave_acceso = ?2",
            COLUMNAS
        );
        conn.query_row(&sql, params![tenant, clave.as_str()], mapear_comprobante)
            .optional()?
            .transpose()
    }

    /// Notas de credito que referencian la factura
    pub fn notas_de_factura(&self, tenant: &str, factura: &ClaveAcceso) -> Result<Vec<Comprobante>, ErrorSri> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM comprobantes WHERE tenant = ?1 AND documento_modificado = ?2 ORDER BY id",
            COLUMNAS
        );
        let mut stmt = conn.prepare(&sql)?;
        let filas = stmt
            .query_map(params![tenant, factura.as_str()], mapear_comprobante)?
            .collect::<Result<Vec<_>, _>>()?;
        filas.into_iter().collect()
    }

    pub fn historial(&self, id: i64) -> Result<Vec<Transicion>, ErrorSri> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT comprobante_id, desde, hacia, fecha, detalle
             FROM comprobante_transiciones WHERE comprobante_id = ?1 ORDER BY id",
        )?;
        let filas = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        filas
            .into_iter()
            .map(|(comprobante_id, desde, hacia, fecha, detalle)| -> Result<Transicion, ErrorSri> {
                Ok(Transicion {
                    comprobante_id,
                    desde: desde.map(|d| d.parse::<EstadoComprobante>()).transpose()?,
                    hacia: hacia.parse::<EstadoComprobante>()?,
                    fecha: DateTime::parse_from_rfc3339(&fecha)
                        .map_err(|e| ErrorSri::Validacion(format!("Fecha de transicion invalida: {}", e)))?
                        .with_timezone(&Utc),
                    detalle,
                })
            })
            .collect()
    }
}

fn insertar_borrador(conn: &Connection, nuevo: &NuevoComprobante) -> Result<i64, ErrorSri> {
    conn.execute(
        "INSERT INTO comprobantes (tenant, cod_doc, clave_acceso, numero, fecha_emision, estado,
                                   importe_total, documento_modificado)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            nuevo.tenant,
            nuevo.tipo.codigo(),
            nuevo.clave_acceso.as_str(),
            nuevo.numero,
            nuevo.fecha_emision.format("%Y-%m-%d").to_string(),
            EstadoComprobante::Borrador.as_str(),
            nuevo.importe_total,
            nuevo.documento_modificado.as_ref().map(|c| c.as_str()),
        ],
    )?;
    let id = conn.last_insert_rowid();
    insertar_transicion(conn, id, None, EstadoComprobante::Borrador, None)?;
    Ok(id)
}

fn actualizar_estado(
    conn: &Connection,
    id: i64,
    desde: EstadoComprobante,
    hacia: EstadoComprobante,
    datos: &DatosTransicion,
) -> Result<(), ErrorSri> {
    let filas = conn.execute(
        "UPDATE comprobantes SET
            estado = ?1,
            xml = COALESCE(?2, xml),
            xml_firmado = COALESCE(?3, xml_firmado),
            numero_autorizacion = COALESCE(?4, numero_autorizacion),
            fecha_autorizacion = COALESCE(?5, fecha_autorizacion),
            updated_at = datetime('now', 'localtime')
         WHERE id = ?6 AND estado = ?7",
        params![
            hacia.as_str(),
            datos.xml,
            datos.xml_firmado,
            datos.numero_autorizacion,
            datos.fecha_autorizacion,
            id,
            desde.as_str(),
        ],
    )?;
    if filas == 0 {
        return Err(ErrorSri::TransicionInvalida {
            desde: desde.to_string(),
            hacia: hacia.to_string(),
        });
    }
    Ok(())
}

fn insertar_transicion(
    conn: &Connection,
    id: i64,
    desde: Option<EstadoComprobante>,
    hacia: EstadoComprobante,
    detalle: Option<&str>,
) -> Result<(), ErrorSri> {
    conn.execute(
        "INSERT INTO comprobante_transiciones (comprobante_id, desde, hacia, fecha, detalle)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            desde.map(|d| d.as_str()),
            hacia.as_str(),
            Utc::now().to_rfc3339(),
            detalle,
        ],
    )?;
    Ok(())
}

fn buscar_por_id(conn: &Connection, id: i64) -> Result<Comprobante, ErrorSri> {
    let sql = format!("SELECT {} FROM comprobantes WHERE id = ?1", COLUMNAS);
    conn.query_row(&sql, params![id], mapear_comprobante)?
}

/// La fila se lee en el closure de rusqlite; los tipos del dominio se validan despues
fn mapear_comprobante(row: &Row<'_>) -> rusqlite::Result<Result<Comprobante, ErrorSri>> {
    let cod_doc: String = row.get(2)?;
    let clave: String = row.get(3)?;
    let fecha: String = row.get(5)?;
    let estado: String = row.get(6)?;
    let modificado: Option<String> = row.get(12)?;

    let id: i64 = row.get(0)?;
    let tenant: String = row.get(1)?;
    let numero: String = row.get(4)?;
    let importe_total: f64 = row.get(7)?;
    let xml: Option<String> = row.get(8)?;
    let xml_firmado: Option<String> = row.get(9)?;
    let numero_autorizacion: Option<String> = row.get(10)?;
    let fecha_autorizacion: Option<String> = row.get(11)?;

    Ok((|| -> Result<Comprobante, ErrorSri> {
        Ok(Comprobante {
            id,
            tenant,
            tipo: TipoComprobante::desde_codigo(&cod_doc)?,
            clave_acceso: clave.parse::<ClaveAcceso>()?,
            numero,
            fecha_emision: NaiveDate::parse_from_str(&fecha, "%Y-%m-%d")
                .map_err(|e| ErrorSri::Validacion(format!("Fecha de emision invalida: {}", e)))?,
            estado: estado.parse::<EstadoComprobante>()?,
            importe_total,
            xml,
            xml_firmado,
            numero_autorizacion,
            fecha_autorizacion,
            documento_modificado: modificado.map(|m| m.parse::<ClaveAcceso>()).transpose()?,
        })
    })())
}
